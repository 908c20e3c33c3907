//! Swap-file storage region.
//!
//! Backs a stream buffer with a throwaway file so a large buffer can spill
//! to disk under memory pressure. The file is unlinked as soon as it is
//! mapped: nothing is persisted, and the space disappears with the mapping
//! when the buffer closes.

use super::{StorageKind, StorageRegion};
use crate::error::{Error, Result};
use rustix::fd::OwnedFd;
use rustix::mm::{MapFlags, ProtFlags};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

/// Distinguishes swap files created by the same process.
static SWAP_SEQ: AtomicU64 = AtomicU64::new(0);

/// A storage region backed by an unlinked temporary file.
pub struct SwapFileRegion {
    /// File descriptor of the (unlinked) backing file.
    /// Kept alive so the kernel retains the inode until drop.
    _fd: OwnedFd,
    /// Pointer to the mmap'd region.
    ptr: NonNull<u8>,
    /// Size of the region.
    len: usize,
}

impl SwapFileRegion {
    /// Create a swap-file region in the system temp directory.
    ///
    /// # Errors
    ///
    /// Returns an error if file creation, truncation, or mapping fails.
    pub fn new(size: usize) -> Result<Self> {
        let path = std::env::temp_dir().join(format!(
            "reservoir-swap-{}-{}",
            std::process::id(),
            SWAP_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        Self::create_at(&path, size)
    }

    /// Create a swap-file region at an explicit path.
    ///
    /// The file is removed from the filesystem immediately after mapping;
    /// the path only matters for placing the backing space on a particular
    /// volume.
    ///
    /// # Errors
    ///
    /// Returns an error if file creation, truncation, or mapping fails.
    pub fn create_at<P: AsRef<Path>>(path: P, size: usize) -> Result<Self> {
        let path: PathBuf = path.as_ref().to_path_buf();

        if size == 0 {
            return Err(Error::AllocationFailed(
                "size must be greater than 0".into(),
            ));
        }

        use rustix::fs::{Mode, OFlags};
        let fd = rustix::fs::open(
            &path,
            OFlags::RDWR | OFlags::CREATE | OFlags::TRUNC,
            Mode::from_raw_mode(0o600),
        )?;

        rustix::fs::ftruncate(&fd, size as u64)?;

        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )?
        };

        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::AllocationFailed("mmap returned null".into()))?;

        // Unlink now; the mapping keeps the inode alive and the space is
        // reclaimed automatically when the region drops.
        rustix::fs::unlink(&path)?;

        Ok(Self {
            _fd: fd,
            ptr,
            len: size,
        })
    }
}

impl StorageRegion for SwapFileRegion {
    fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn len(&self) -> usize {
        self.len
    }

    fn kind(&self) -> StorageKind {
        StorageKind::SwapFile
    }
}

impl Drop for SwapFileRegion {
    fn drop(&mut self) {
        unsafe {
            let _ = rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len);
        }
        // fd closes with OwnedFd; the unlinked inode disappears with it.
    }
}

// SAFETY: SwapFileRegion is Send + Sync because:
// - File mappings can be safely accessed from any thread
// - The kernel handles synchronization for SHARED mappings
unsafe impl Send for SwapFileRegion {}
unsafe impl Sync for SwapFileRegion {}
