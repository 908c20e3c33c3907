//! Storage backends for stream buffers.
//!
//! A stream buffer owns exactly one contiguous allocation. This module
//! provides the backends that allocation can come from and the handle type
//! used to own (and optionally split) it:
//!
//! - [`StorageRegion`]: trait over the backends (heap, anonymous mmap,
//!   swap file)
//! - [`RegionHandle`]: owning view into a region; [`RegionHandle::split_off`]
//!   carves a sub-region for a sibling buffer
//!
//! # Example
//!
//! ```rust,ignore
//! use reservoir::memory::{AnonRegion, RegionHandle};
//! use std::sync::Arc;
//!
//! // One allocation, split between a video and an audio buffer.
//! let region = Arc::new(AnonRegion::new("av-buffer", 1024 * 1024)?);
//! let mut video = RegionHandle::from_region(region);
//! let audio = video.split_off(768 * 1024);
//! ```

mod anon;
mod heap;
mod region;
mod swap;

pub use anon::AnonRegion;
pub use heap::HeapRegion;
pub use region::{RegionHandle, StorageKind, StorageRegion};
pub use swap::SwapFileRegion;
