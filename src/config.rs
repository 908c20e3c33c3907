//! Stream buffer configuration.
//!
//! All tunables are carried in an explicit [`StreamConfig`] passed at open
//! time; the engine keeps no process-wide state.

use crate::error::{Error, Result};
use crate::memory::RegionHandle;

/// Where a stream buffer's backing allocation comes from.
#[derive(Debug, Clone)]
pub enum StorageMode {
    /// Regular heap allocation.
    Heap,
    /// Anonymous shared memory (memfd + mmap).
    AnonMap,
    /// Throwaway swap file, unlinked at creation and gone on close.
    SwapFile,
    /// A sub-region carved out of a sibling buffer's allocation.
    ///
    /// The handle must have been split off before either buffer starts
    /// filling; its length (minus the overlap) becomes the ring capacity.
    Borrowed(RegionHandle),
}

/// Configuration for a stream buffer.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Ring capacity in bytes (excluding the overlap mirror).
    pub buffer_size: usize,

    /// Mirrored tail size in bytes; the demuxer can scan this far past the
    /// ring's nominal end without a wraparound branch.
    pub overlap_size: usize,

    /// Absolute byte offset where filling starts.
    pub start_offset: u64,

    /// Absolute byte offset where the stream ends, if known. Filling stops
    /// once the write position reaches it.
    pub end_offset: Option<u64>,

    /// Backing storage selection.
    pub storage: StorageMode,

    /// Buffered-playback margin (ms) the fill thread aims for while the
    /// device is awake; once predicted playback time exceeds it the device
    /// may be allowed to sleep.
    pub wake_awake_ms: u64,

    /// Buffered-playback margin (ms) below which a sleeping device is woken
    /// to resume filling. Smaller than the awake margin so the device is
    /// not bounced in and out of sleep.
    pub wake_asleep_ms: u64,

    /// Upper bound on a single backend read, in bytes.
    pub max_read_burst: usize,

    /// Block alignment for reload positions, for block devices that can
    /// only seek to sector boundaries.
    pub block_align: Option<usize>,

    /// Minimum number of bytes that must be buffered past the scan cursor
    /// before `open` and seek reloads return, so the demuxer can parse a
    /// header or resync immediately.
    pub min_parse_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_size: 512 * 1024,
            overlap_size: 16 * 1024,
            start_offset: 0,
            end_offset: None,
            storage: StorageMode::AnonMap,
            wake_awake_ms: 8000,
            wake_asleep_ms: 2000,
            max_read_burst: 256 * 1024,
            block_align: None,
            min_parse_size: 4096,
        }
    }
}

impl StreamConfig {
    /// Configuration for memory-constrained targets.
    ///
    /// A small heap ring with short bursts; power policy disabled in
    /// practice because the margins are tiny.
    pub fn low_memory() -> Self {
        Self {
            buffer_size: 64 * 1024,
            overlap_size: 4 * 1024,
            storage: StorageMode::Heap,
            wake_awake_ms: 1000,
            wake_asleep_ms: 250,
            max_read_burst: 16 * 1024,
            min_parse_size: 1024,
            ..Self::default()
        }
    }

    /// Configuration for spinning or power-managed media.
    ///
    /// A large swap-file ring filled in big bursts, with wide wake margins
    /// so the device can spin down between fills.
    pub fn spinning_media() -> Self {
        Self {
            buffer_size: 4 * 1024 * 1024,
            overlap_size: 64 * 1024,
            storage: StorageMode::SwapFile,
            wake_awake_ms: 20000,
            wake_asleep_ms: 5000,
            max_read_burst: 512 * 1024,
            block_align: Some(2048),
            ..Self::default()
        }
    }

    /// Check the configuration for internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size < 2 {
            return Err(Error::AllocationFailed(
                "buffer size must be at least 2 bytes".into(),
            ));
        }
        if self.overlap_size >= self.buffer_size {
            return Err(Error::AllocationFailed(
                "overlap must be smaller than the buffer".into(),
            ));
        }
        if self.min_parse_size > self.buffer_size {
            return Err(Error::AllocationFailed(
                "minimum parse size exceeds the buffer".into(),
            ));
        }
        if let Some(align) = self.block_align {
            if align == 0 {
                return Err(Error::AllocationFailed(
                    "block alignment must be non-zero".into(),
                ));
            }
        }
        if let Some(end) = self.end_offset {
            if end < self.start_offset {
                return Err(Error::AllocationFailed(
                    "end offset precedes start offset".into(),
                ));
            }
        }
        Ok(())
    }
}
