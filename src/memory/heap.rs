//! Heap-backed storage region.

use super::{StorageKind, StorageRegion};
use crate::error::{Error, Result};
use std::cell::UnsafeCell;

/// A storage region backed by heap allocation.
///
/// The simplest backend, suitable for small buffers on systems where the
/// allocation is not expected to be paged out.
///
/// # Example
///
/// ```rust
/// use reservoir::memory::{HeapRegion, StorageRegion};
///
/// let region = HeapRegion::new(1024).unwrap();
/// assert_eq!(region.len(), 1024);
/// ```
pub struct HeapRegion {
    /// The underlying allocation.
    /// A boxed slice keeps the memory contiguous and never reallocated;
    /// UnsafeCell allows mutation through the shared handles the stream
    /// buffer clones into its fill thread.
    data: Box<[UnsafeCell<u8>]>,
}

impl HeapRegion {
    /// Create a new heap region with the given size.
    ///
    /// The memory is zero-initialized.
    ///
    /// # Errors
    ///
    /// Returns an error if size is 0.
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::AllocationFailed(
                "size must be greater than 0".into(),
            ));
        }

        let data = (0..size)
            .map(|_| UnsafeCell::new(0u8))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self { data })
    }
}

impl StorageRegion for HeapRegion {
    fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr().cast()
    }

    fn as_mut_ptr(&self) -> *mut u8 {
        self.data.as_ptr() as *mut u8
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn kind(&self) -> StorageKind {
        StorageKind::Heap
    }
}

// SAFETY: The UnsafeCell contents are only touched through the raw-pointer
// accessors, whose callers take on the exclusivity contract.
unsafe impl Send for HeapRegion {}
unsafe impl Sync for HeapRegion {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_region_creation() {
        let region = HeapRegion::new(1024).unwrap();
        assert_eq!(region.len(), 1024);
        assert_eq!(region.kind(), StorageKind::Heap);
    }

    #[test]
    fn test_heap_region_zero_size_fails() {
        let result = HeapRegion::new(0);
        assert!(result.is_err());
    }

    #[test]
    fn test_heap_region_read_write() {
        let region = HeapRegion::new(1024).unwrap();

        let ptr = region.as_mut_ptr();
        unsafe {
            std::ptr::write(ptr, 42);
            std::ptr::write(ptr.add(1), 43);
        }

        unsafe {
            assert_eq!(*region.as_ptr(), 42);
            assert_eq!(*region.as_ptr().add(1), 43);
        }
    }

    #[test]
    fn test_heap_region_is_zeroed() {
        let region = HeapRegion::new(1024).unwrap();
        let slice = unsafe { std::slice::from_raw_parts(region.as_ptr(), region.len()) };
        assert!(slice.iter().all(|&b| b == 0));
    }
}
