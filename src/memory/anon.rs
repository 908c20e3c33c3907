//! Anonymous mmap storage region using Linux memfd.
//!
//! Backing a stream buffer with an anonymous mapping instead of the heap
//! keeps large allocations out of the allocator arena and lets the kernel
//! reclaim the pages wholesale when the buffer closes.

use super::{StorageKind, StorageRegion};
use crate::error::{Error, Result};
use rustix::fd::OwnedFd;
use rustix::mm::{MapFlags, ProtFlags};
use std::ffi::CString;
use std::ptr::NonNull;

/// A storage region backed by anonymous shared memory (memfd + mmap).
pub struct AnonRegion {
    /// The memfd file descriptor.
    fd: OwnedFd,
    /// Pointer to the mmap'd region.
    ptr: NonNull<u8>,
    /// Size of the region.
    len: usize,
}

impl AnonRegion {
    /// Create a new anonymous mapped region.
    ///
    /// # Arguments
    ///
    /// * `name` - Debug name (visible in `/proc/self/fd/`).
    /// * `size` - Size in bytes. Must be greater than 0.
    ///
    /// # Errors
    ///
    /// Returns an error if `memfd_create`, `ftruncate`, or `mmap` fails.
    pub fn new(name: &str, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::AllocationFailed(
                "size must be greater than 0".into(),
            ));
        }

        let cname = CString::new(name).map_err(|e| Error::AllocationFailed(e.to_string()))?;
        let fd = rustix::fs::memfd_create(&cname, rustix::fs::MemfdFlags::CLOEXEC)?;

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

        Ok(Self {
            fd,
            ptr,
            len: size,
        })
    }

    /// Pre-fault the memory to avoid page faults during filling.
    ///
    /// Touches every page so physical memory is allocated up front.
    pub fn prefault(&self) {
        let page_size = 4096;
        let ptr = self.ptr.as_ptr();
        for offset in (0..self.len).step_by(page_size) {
            unsafe {
                // Volatile read to prevent optimization
                std::ptr::read_volatile(ptr.add(offset));
            }
        }
    }
}

impl StorageRegion for AnonRegion {
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
        StorageKind::AnonMap
    }
}

impl Drop for AnonRegion {
    fn drop(&mut self) {
        unsafe {
            let _ = rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len);
        }
        // fd is automatically closed when OwnedFd is dropped
    }
}

// SAFETY: AnonRegion is Send + Sync because:
// - The mapping can be accessed from any thread
// - The fd is reference-counted by the kernel
// - We don't hold any thread-local state
unsafe impl Send for AnonRegion {}
unsafe impl Sync for AnonRegion {}
