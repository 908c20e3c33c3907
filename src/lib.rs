//! # Reservoir
//!
//! A stream buffering engine for media playback on slow, bursty, or
//! power-managed storage.
//!
//! Reservoir sits between raw I/O and the demuxer/decoders of a player:
//! it keeps enough data resident to survive seek latency and storage
//! spin-up, reclaims memory behind the slowest-consuming elementary
//! stream, supports forward/backward seeks with partial buffer reuse, and
//! hands decoded frames to a renderer through a lock-protected FIFO with
//! priority re-insertion.
//!
//! ## Components
//!
//! - **Ring primitives**: [`ring::CircularBuffer`] and
//!   [`overlap::OverlapBuffer`] (a ring with a mirrored tail so fixed
//!   lookahead scans never branch on the wrap point)
//! - **Stream engine**: [`stream::StreamBuffer`], one allocation filled by
//!   a background thread from a pluggable [`io::MediaIo`] backend
//! - **Frame handoff**: [`frame::FrameArena`] and [`frame::FrameQueue`]
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use reservoir::prelude::*;
//!
//! let io = FileIo::new("movie.mkv");
//! let mut buf = StreamBuffer::open(Some(Box::new(io)), StreamConfig::default())?;
//!
//! // Demuxer side: scan, consume, and release per-stream.
//! let mut header = [0u8; 64];
//! buf.wait_data(header.len(), std::time::Duration::from_secs(2));
//! buf.read(&mut header)?;
//! buf.free_data(StreamKind::Video, buf.scan_pos());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod error;
pub mod frame;
pub mod io;
pub mod memory;
pub mod overlap;
pub mod ring;
pub mod stream;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::{StorageMode, StreamConfig};
    pub use crate::error::{Error, Result};
    pub use crate::frame::{FrameArena, FrameId, FrameQueue, FrameStage, VideoFrame};
    pub use crate::io::{AbortFlag, FileIo, MediaIo, MemoryIo, OpenMode, ReadOutcome};
    pub use crate::overlap::OverlapBuffer;
    pub use crate::ring::CircularBuffer;
    pub use crate::stream::{StreamBuffer, StreamKind};
}

pub use error::{Error, Result};
