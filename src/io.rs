//! Pluggable I/O backends for stream buffers.
//!
//! The fill thread pulls bytes through [`MediaIo`]; anything that can
//! `open`/`seek`/`read` can feed a buffer (files, network transports,
//! block devices). Blocking calls are cancelled cooperatively: backends
//! poll the [`AbortFlag`] they are handed and bail out with a
//! distinguished [`ReadOutcome`] instead of returning a byte count.

use crate::error::{Error, Result};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Access mode requested when opening a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read-only access (playback).
    Read,
    /// Read-write access.
    ReadWrite,
}

/// The two kinds of cooperative cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortKind {
    /// Cancel the in-flight operation only; the stream remains usable.
    Current,
    /// The stream is being torn down; no further operations will follow.
    Final,
}

/// Result of a single backend read.
///
/// This replaces the classic convention of negative return values carrying
/// abort codes: every non-data case is its own variant.
#[derive(Debug)]
pub enum ReadOutcome {
    /// `n` bytes were produced into the buffer.
    Data(usize),
    /// No data available right now; retry after a short backoff.
    NotReady,
    /// The source has no further data.
    Eof,
    /// The read was cancelled via the abort flag.
    Aborted(AbortKind),
    /// The backend failed; fatal to the stream.
    Failed(Error),
}

/// Shared cancellation flag polled by backends during blocking calls.
///
/// A `Current` request is consumed by the first check that observes it; a
/// `Final` request latches until the stream is gone.
#[derive(Clone, Default)]
pub struct AbortFlag {
    inner: Arc<AbortInner>,
}

#[derive(Default)]
struct AbortInner {
    current: AtomicBool,
    teardown: AtomicBool,
}

impl AbortFlag {
    /// Create a flag with no pending aborts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of the in-flight operation only.
    pub fn request_current(&self) {
        self.inner.current.store(true, Ordering::Release);
    }

    /// Request teardown: every subsequent check observes `Final`.
    pub fn request_final(&self) {
        self.inner.teardown.store(true, Ordering::Release);
    }

    /// Returns true once teardown has been requested.
    pub fn is_final(&self) -> bool {
        self.inner.teardown.load(Ordering::Acquire)
    }

    /// Poll for a pending abort. `Final` wins over `Current`; a `Current`
    /// request is consumed by the check that observes it.
    pub fn check(&self) -> Option<AbortKind> {
        if self.inner.teardown.load(Ordering::Acquire) {
            return Some(AbortKind::Final);
        }
        if self.inner.current.swap(false, Ordering::AcqRel) {
            return Some(AbortKind::Current);
        }
        None
    }
}

/// Capability consumed by a stream buffer to pull bytes from a source.
///
/// Implementations must poll the abort flag inside any call that can
/// block and return [`ReadOutcome::Aborted`] promptly when it is raised.
pub trait MediaIo: Send {
    /// Open the source.
    fn open(&mut self, mode: OpenMode) -> Result<()>;

    /// Close the source. Idempotent.
    fn close(&mut self);

    /// Reposition the source; returns the position actually reached
    /// (a block device may not land exactly where asked).
    fn seek(&mut self, pos: u64) -> Result<u64>;

    /// Read into `buf` at the current position.
    fn read(&mut self, buf: &mut [u8], abort: &AbortFlag) -> ReadOutcome;

    /// Whether `len` bytes at absolute `pos` could be satisfied.
    fn can_read(&self, pos: u64, len: usize) -> bool;

    /// Whether the source supports repositioning at all.
    fn is_seekable(&self) -> bool;

    /// Whether the underlying device may be put to sleep between fills.
    fn is_sleepable(&self) -> bool;
}

/// File-backed I/O source.
///
/// # Example
///
/// ```rust,ignore
/// use reservoir::io::{FileIo, MediaIo, OpenMode};
///
/// let mut io = FileIo::new("movie.mkv");
/// io.open(OpenMode::Read)?;
/// ```
pub struct FileIo {
    path: PathBuf,
    file: Option<File>,
    len: u64,
}

impl FileIo {
    /// Create a source reading the given path. The file is not opened
    /// until [`MediaIo::open`] is called.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: None,
            len: 0,
        }
    }

    /// The path being read.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Length of the file, known after open.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns true if the file was empty (or not yet opened).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl MediaIo for FileIo {
    fn open(&mut self, mode: OpenMode) -> Result<()> {
        let file = match mode {
            OpenMode::Read => File::open(&self.path),
            OpenMode::ReadWrite => File::options().read(true).write(true).open(&self.path),
        }
        .map_err(|e| Error::IoOpen(format!("{}: {}", self.path.display(), e)))?;

        self.len = file
            .metadata()
            .map_err(|e| Error::IoOpen(e.to_string()))?
            .len();
        self.file = Some(file);
        Ok(())
    }

    fn close(&mut self) {
        self.file = None;
    }

    fn seek(&mut self, pos: u64) -> Result<u64> {
        let file = self.file.as_mut().ok_or(Error::Closed)?;
        Ok(file.seek(SeekFrom::Start(pos))?)
    }

    fn read(&mut self, buf: &mut [u8], abort: &AbortFlag) -> ReadOutcome {
        if let Some(kind) = abort.check() {
            return ReadOutcome::Aborted(kind);
        }
        let Some(file) = self.file.as_mut() else {
            return ReadOutcome::Failed(Error::Closed);
        };
        match file.read(buf) {
            Ok(0) => ReadOutcome::Eof,
            Ok(n) => ReadOutcome::Data(n),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => ReadOutcome::NotReady,
            Err(e) => ReadOutcome::Failed(Error::IoRead(e.to_string())),
        }
    }

    fn can_read(&self, pos: u64, len: usize) -> bool {
        self.file.is_some() && pos + len as u64 <= self.len
    }

    fn is_seekable(&self) -> bool {
        true
    }

    fn is_sleepable(&self) -> bool {
        false
    }
}

/// Counters exposed by [`MemoryIo`] for asserting I/O behavior in tests.
#[derive(Debug, Default)]
pub struct IoStats {
    /// Number of `read` calls that reached the backend.
    pub reads: AtomicU64,
    /// Number of `seek` calls.
    pub seeks: AtomicU64,
    /// Total bytes handed out.
    pub bytes_read: AtomicU64,
    /// Number of reads cancelled by the abort flag.
    pub aborted: AtomicU64,
    /// Largest single read observed.
    pub max_read: AtomicU64,
}

/// In-memory I/O source with scriptable behavior.
///
/// Serves a byte vector while counting backend calls, so tests can assert
/// properties like "an in-buffer seek issues zero I/O". Bursts, transient
/// not-ready windows, sleep capability, read failures, and seek overshoot
/// are all scriptable.
pub struct MemoryIo {
    data: Vec<u8>,
    pos: u64,
    opened: bool,
    stats: Arc<IoStats>,
    burst_cap: Option<usize>,
    not_ready_budget: AtomicU32,
    sleepable: bool,
    fail_at: Option<u64>,
    seek_overshoot: u64,
}

impl MemoryIo {
    /// Create a source serving `data`.
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            pos: 0,
            opened: false,
            stats: Arc::new(IoStats::default()),
            burst_cap: None,
            not_ready_budget: AtomicU32::new(0),
            sleepable: false,
            fail_at: None,
            seek_overshoot: 0,
        }
    }

    /// Create a source serving `len` bytes of a counting pattern.
    pub fn counting(len: usize) -> Self {
        Self::new((0..len).map(|i| (i % 251) as u8).collect())
    }

    /// Cap every read at `cap` bytes regardless of the buffer offered.
    pub fn with_burst_cap(mut self, cap: usize) -> Self {
        self.burst_cap = Some(cap);
        self
    }

    /// Make the next `n` reads return `NotReady`.
    pub fn with_not_ready(self, n: u32) -> Self {
        self.not_ready_budget.store(n, Ordering::Relaxed);
        self
    }

    /// Report the device as sleepable.
    pub fn sleepable(mut self) -> Self {
        self.sleepable = true;
        self
    }

    /// Fail any read that starts at or past `pos`.
    pub fn with_fail_at(mut self, pos: u64) -> Self {
        self.fail_at = Some(pos);
        self
    }

    /// Make every seek land `n` bytes past the requested position,
    /// simulating a misbehaving backend.
    pub fn with_seek_overshoot(mut self, n: u64) -> Self {
        self.seek_overshoot = n;
        self
    }

    /// Handle to the call counters; stays valid after the backend moves
    /// into a stream buffer.
    pub fn stats(&self) -> Arc<IoStats> {
        Arc::clone(&self.stats)
    }
}

impl MediaIo for MemoryIo {
    fn open(&mut self, _mode: OpenMode) -> Result<()> {
        self.opened = true;
        Ok(())
    }

    fn close(&mut self) {
        self.opened = false;
    }

    fn seek(&mut self, pos: u64) -> Result<u64> {
        if !self.opened {
            return Err(Error::Closed);
        }
        self.stats.seeks.fetch_add(1, Ordering::Relaxed);
        self.pos = pos + self.seek_overshoot;
        Ok(self.pos)
    }

    fn read(&mut self, buf: &mut [u8], abort: &AbortFlag) -> ReadOutcome {
        if !self.opened {
            return ReadOutcome::Failed(Error::Closed);
        }
        if let Some(kind) = abort.check() {
            self.stats.aborted.fetch_add(1, Ordering::Relaxed);
            return ReadOutcome::Aborted(kind);
        }
        if self
            .not_ready_budget
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                n.checked_sub(1)
            })
            .is_ok()
        {
            return ReadOutcome::NotReady;
        }
        if let Some(fail_at) = self.fail_at {
            if self.pos >= fail_at {
                return ReadOutcome::Failed(Error::IoRead(format!(
                    "scripted failure at {fail_at}"
                )));
            }
        }

        self.stats.reads.fetch_add(1, Ordering::Relaxed);

        let remaining = self.data.len().saturating_sub(self.pos as usize);
        if remaining == 0 {
            return ReadOutcome::Eof;
        }
        let mut n = buf.len().min(remaining);
        if let Some(cap) = self.burst_cap {
            n = n.min(cap);
        }
        let start = self.pos as usize;
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        self.pos += n as u64;

        self.stats.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
        self.stats.max_read.fetch_max(n as u64, Ordering::Relaxed);
        ReadOutcome::Data(n)
    }

    fn can_read(&self, pos: u64, len: usize) -> bool {
        self.opened && pos as usize + len <= self.data.len()
    }

    fn is_seekable(&self) -> bool {
        true
    }

    fn is_sleepable(&self) -> bool {
        self.sleepable
    }
}
