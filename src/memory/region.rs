//! Storage region trait and the sub-region handle.

use std::sync::Arc;

/// Type of storage backing a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKind {
    /// Regular heap memory.
    Heap,
    /// Anonymous shared memory (memfd + mmap).
    AnonMap,
    /// Throwaway swap file, memory-mapped and unlinked at creation.
    SwapFile,
}

/// Trait for storage region backends.
///
/// A storage region is the single contiguous allocation backing a stream
/// buffer. Different implementations trade allocation cost against memory
/// pressure behavior (heap, anonymous mmap, file-backed swap).
///
/// # Safety
///
/// Implementations must ensure that:
/// - Pointers remain valid for the lifetime of the region
/// - Thread-safety requirements are met (Send + Sync)
pub trait StorageRegion: Send + Sync {
    /// Get a raw pointer to the start of this region.
    fn as_ptr(&self) -> *const u8;

    /// Get a mutable pointer to the start of this region.
    fn as_mut_ptr(&self) -> *mut u8;

    /// Total size of the region in bytes.
    fn len(&self) -> usize;

    /// Returns true if the region has zero length.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The kind of storage backing this region.
    fn kind(&self) -> StorageKind;
}

/// Handle to a byte range within a storage region.
///
/// Cheap to clone (Arc increment plus offset/len copy). A handle is how a
/// stream buffer owns its allocation: the full region after open, or a
/// carved sub-region when one buffer borrows space from a sibling (see
/// [`RegionHandle::split_off`]).
#[derive(Clone)]
pub struct RegionHandle {
    /// The backing storage region.
    region: Arc<dyn StorageRegion>,
    /// Offset within the region.
    offset: usize,
    /// Length of this handle's range.
    len: usize,
}

impl RegionHandle {
    /// Create a handle covering an entire region.
    pub fn from_region(region: Arc<dyn StorageRegion>) -> Self {
        let len = region.len();
        Self {
            region,
            offset: 0,
            len,
        }
    }

    /// Create a handle covering a byte range of a region.
    ///
    /// # Panics
    ///
    /// Panics if `offset + len > region.len()`.
    pub fn new(region: Arc<dyn StorageRegion>, offset: usize, len: usize) -> Self {
        assert!(
            offset + len <= region.len(),
            "region handle exceeds region bounds"
        );
        Self {
            region,
            offset,
            len,
        }
    }

    /// Length of this handle's range.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if this handle has zero length.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Offset of this handle within the backing region.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// The kind of storage backing this handle.
    pub fn kind(&self) -> StorageKind {
        self.region.kind()
    }

    /// Split this handle at `at`, transferring ownership of the upper part.
    ///
    /// `self` shrinks to `[0, at)` and the returned handle covers
    /// `[at, len)`. This is how a second buffer carves a dedicated region
    /// (e.g. for audio) out of an already-allocated buffer; the split must
    /// happen before either side starts filling.
    ///
    /// # Panics
    ///
    /// Panics if `at > self.len()`.
    pub fn split_off(&mut self, at: usize) -> RegionHandle {
        assert!(at <= self.len, "split point exceeds handle bounds");
        let child = Self {
            region: Arc::clone(&self.region),
            offset: self.offset + at,
            len: self.len - at,
        };
        self.len = at;
        child
    }

    /// Get this handle's range as a byte slice.
    ///
    /// # Safety
    ///
    /// The caller must ensure no mutable references exist to this range.
    pub unsafe fn as_slice(&self) -> &[u8] {
        // SAFETY: Caller guarantees no mutable references exist.
        unsafe { std::slice::from_raw_parts(self.region.as_ptr().add(self.offset), self.len) }
    }

    /// Get this handle's range as a mutable byte slice.
    ///
    /// This returns a mutable reference from `&self` because the same
    /// handle is cloned into the fill thread; callers must ensure exclusive
    /// access (in a stream buffer, every access happens under the state
    /// mutex).
    ///
    /// # Safety
    ///
    /// The caller must ensure exclusive access to this range.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        // SAFETY: Caller guarantees exclusive access.
        unsafe {
            std::slice::from_raw_parts_mut(self.region.as_mut_ptr().add(self.offset), self.len)
        }
    }
}

impl std::fmt::Debug for RegionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionHandle")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("kind", &self.kind())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::HeapRegion;

    #[test]
    fn test_handle_covers_region() {
        let region = Arc::new(HeapRegion::new(1024).unwrap());
        let handle = RegionHandle::from_region(region);
        assert_eq!(handle.len(), 1024);
        assert_eq!(handle.offset(), 0);
        assert_eq!(handle.kind(), StorageKind::Heap);
    }

    #[test]
    fn test_split_off_transfers_upper_part() {
        let region = Arc::new(HeapRegion::new(1024).unwrap());
        let mut parent = RegionHandle::from_region(region);
        let child = parent.split_off(768);

        assert_eq!(parent.len(), 768);
        assert_eq!(parent.offset(), 0);
        assert_eq!(child.len(), 256);
        assert_eq!(child.offset(), 768);
    }

    #[test]
    fn test_split_halves_do_not_alias() {
        let region = Arc::new(HeapRegion::new(64).unwrap());
        let mut parent = RegionHandle::from_region(region);
        let child = parent.split_off(32);

        unsafe {
            parent.as_mut_slice().fill(1);
            child.as_mut_slice().fill(2);
            assert!(parent.as_slice().iter().all(|&b| b == 1));
            assert!(child.as_slice().iter().all(|&b| b == 2));
        }
    }

    #[test]
    #[should_panic(expected = "split point exceeds handle bounds")]
    fn test_split_out_of_bounds() {
        let region = Arc::new(HeapRegion::new(64).unwrap());
        let mut parent = RegionHandle::from_region(region);
        let _ = parent.split_off(65);
    }

    #[test]
    #[should_panic(expected = "region handle exceeds region bounds")]
    fn test_handle_out_of_bounds() {
        let region = Arc::new(HeapRegion::new(64).unwrap());
        let _ = RegionHandle::new(region, 32, 64);
    }
}
