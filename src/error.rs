//! Error types for Reservoir.

use thiserror::Error;

/// Result type alias using Reservoir's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Reservoir operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Backing storage could not be allocated (fatal to open).
    #[error("allocation failed: {0}")]
    AllocationFailed(String),

    /// The I/O backend could not be opened (fatal to open).
    #[error("backend open failed: {0}")]
    IoOpen(String),

    /// The I/O backend failed a read or seek after open.
    ///
    /// Beyond a final abort this is fatal to the stream; it is latched
    /// rather than retried so media data is never silently dropped.
    #[error("backend read failed: {0}")]
    IoRead(String),

    /// Not enough buffered data to satisfy the request.
    ///
    /// Ordinary non-fatal status; the caller backs off and retries.
    #[error("not enough buffered data")]
    InsufficientData,

    /// Not enough free space to accept the write.
    ///
    /// Ordinary non-fatal status; the caller backs off and retries.
    #[error("not enough free space")]
    InsufficientSpace,

    /// A seek reload landed past its target.
    ///
    /// This indicates an accounting or backend bug, not a transient
    /// condition. It is latched as a stream-fatal error and never retried.
    #[error("seek reload overshot its target: wanted {expected}, backend reports {actual}")]
    SeekInconsistency {
        /// Position the reload asked the backend for.
        expected: u64,
        /// Position the backend reports after the seek.
        actual: u64,
    },

    /// A frame was moved by a stage that does not currently own it.
    #[error("frame is owned by another stage")]
    FrameOwnership,

    /// The stream has a latched fatal error; see
    /// [`StreamBuffer::take_error`](crate::stream::StreamBuffer::take_error).
    #[error("stream has a latched fatal error")]
    Faulted,

    /// The buffer has been closed.
    #[error("buffer is closed")]
    Closed,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}
