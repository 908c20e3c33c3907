//! The stream buffering engine.
//!
//! A [`StreamBuffer`] owns one contiguous allocation, filled by a
//! background thread pulling from a [`MediaIo`] backend and drained by the
//! demuxer through a scan cursor. Between the two sit the mechanisms that
//! make playback survive slow or power-managed storage:
//!
//! - an overlap mirror so bitstream scans never branch on the wrap point
//! - per-elementary-stream watermarks bounding how far behind the slowest
//!   consumer memory may be reclaimed
//! - a seek protocol that repositions in place when the target is still
//!   buffered and reloads otherwise
//! - a wake policy that stops filling once enough playback time is
//!   buffered, letting the device sleep
//!
//! All cursor state lives behind one mutex; the only blocking call made
//! while holding it is the backend read, which has a cooperative abort
//! path. The buffer itself never blocks consumers: insufficient data is an
//! ordinary status, and [`StreamBuffer::wait_data`] offers a condition
//! variable for callers that prefer waiting to polling.

use crate::config::{StorageMode, StreamConfig};
use crate::error::{Error, Result};
use crate::io::{AbortFlag, AbortKind, MediaIo, OpenMode, ReadOutcome};
use crate::memory::{AnonRegion, HeapRegion, RegionHandle, SwapFileRegion};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// Backoff after the backend reports `NotReady`.
const NOT_READY_BACKOFF: Duration = Duration::from_millis(10);

/// Wait granularity for the fill thread's idle states (buffer full, end of
/// data, latched error, device asleep). Consumption and seeks signal the
/// condition variable, so this only bounds wakeup staleness at teardown.
const IDLE_WAIT: Duration = Duration::from_millis(50);

/// One elementary stream multiplexed in the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Video track.
    Video,
    /// Audio track.
    Audio,
    /// Subtitle track.
    Subtitle,
}

impl StreamKind {
    /// All stream kinds, in watermark-array order.
    pub const ALL: [StreamKind; 3] = [StreamKind::Video, StreamKind::Audio, StreamKind::Subtitle];

    const fn index(self) -> usize {
        match self {
            StreamKind::Video => 0,
            StreamKind::Audio => 1,
            StreamKind::Subtitle => 2,
        }
    }
}

/// Moving-average estimate of the demuxer's consumption rate, used to
/// predict how many milliseconds of playback the buffered bytes cover.
struct RateEstimator {
    /// Exponential moving average; 0.0 while unknown.
    bytes_per_sec: f64,
    window_bytes: u64,
    window_start: Option<Instant>,
}

impl RateEstimator {
    const WINDOW: Duration = Duration::from_millis(250);

    fn new() -> Self {
        Self {
            bytes_per_sec: 0.0,
            window_bytes: 0,
            window_start: None,
        }
    }

    fn note_consumed(&mut self, bytes: usize) {
        let now = Instant::now();
        let start = *self.window_start.get_or_insert(now);
        self.window_bytes += bytes as u64;

        let elapsed = now.duration_since(start);
        if elapsed >= Self::WINDOW {
            let instant_rate = self.window_bytes as f64 / elapsed.as_secs_f64();
            self.bytes_per_sec = if self.bytes_per_sec > 0.0 {
                0.75 * self.bytes_per_sec + 0.25 * instant_rate
            } else {
                instant_rate
            };
            self.window_bytes = 0;
            self.window_start = Some(now);
        }
    }

    /// Predicted playback milliseconds covered by `buffered` bytes, or
    /// `None` while the rate is still unknown.
    fn predicted_ms(&self, buffered: u64) -> Option<u64> {
        if self.bytes_per_sec > 0.0 {
            Some((buffered as f64 * 1000.0 / self.bytes_per_sec) as u64)
        } else {
            None
        }
    }

    /// Restart the sampling window (after a seek) without discarding the
    /// learned average.
    fn restart_window(&mut self) {
        self.window_bytes = 0;
        self.window_start = None;
    }
}

/// Cursor and mode state, all behind the per-buffer mutex.
struct FillState {
    io: Option<Box<dyn MediaIo>>,
    /// Absolute write position (newest buffered byte).
    head: u64,
    /// Absolute scan position (demuxer's cursor).
    scan: u64,
    /// Per-elementary-stream consumed-through positions; absent entries
    /// are tracks with no active stream and never pin the tail.
    watermarks: [Option<u64>; 3],
    eof: bool,
    wrapped: bool,
    /// Device sleep mode: true once enough playback time is buffered.
    sleeping: bool,
    /// Latched stream-fatal failure. Stays true even after the error
    /// value itself has been taken.
    failed: bool,
    error: Option<Error>,
    rate: RateEstimator,
}

impl FillState {
    /// Oldest buffered byte still needed by any active stream.
    fn tail(&self) -> u64 {
        self.watermarks
            .iter()
            .flatten()
            .copied()
            .min()
            .unwrap_or(self.scan)
    }

    /// Bytes buffered ahead of the scan cursor.
    fn buffered(&self) -> u64 {
        self.head.saturating_sub(self.scan)
    }
}

/// Outcome of one bounded fill attempt.
enum FillStep {
    Filled,
    NoSpace,
    NotReady,
    Eof,
    Aborted(AbortKind),
    Failed,
}

/// State shared between the owner and the fill thread.
struct Shared {
    state: Mutex<FillState>,
    /// Signalled by the fill thread after data lands (and on eof/failure).
    data_ready: Condvar,
    /// Signalled by consumption, reclaim, and seeks.
    space_free: Condvar,
    running: AtomicBool,
    abort: AbortFlag,
    region: RegionHandle,
    /// Ring capacity (region length minus the overlap mirror).
    nominal: usize,
    overlap: usize,
    cfg: StreamConfig,
}

impl Shared {
    fn index(&self, pos: u64) -> usize {
        (pos % self.nominal as u64) as usize
    }

    fn free_bytes(&self, st: &FillState) -> usize {
        let window = st.head.saturating_sub(st.tail()) as usize;
        self.nominal.saturating_sub(window + 1)
    }

    /// The whole region as a byte slice.
    ///
    /// # Safety
    ///
    /// The caller must hold the state mutex; that is the exclusivity the
    /// region handle's contract requires.
    unsafe fn region_ref(&self) -> &[u8] {
        unsafe { self.region.as_slice() }
    }

    /// The whole region as a mutable byte slice.
    ///
    /// # Safety
    ///
    /// The caller must hold the state mutex.
    #[allow(clippy::mut_from_ref)]
    unsafe fn region_mut(&self) -> &mut [u8] {
        unsafe { self.region.as_mut_slice() }
    }

    /// Mirror the part of `[start, start + len)` that lies in the overlap
    /// span out past the ring's nominal end.
    fn mirror(&self, data: &mut [u8], start: usize, len: usize) {
        if start < self.overlap {
            let m = len.min(self.overlap - start);
            data.copy_within(start..start + m, self.nominal + start);
        }
    }

    /// Copy `bytes` into the ring at the head and publish them.
    ///
    /// Caller must hold the state mutex and have verified free space.
    fn push_bytes(&self, st: &mut FillState, bytes: &[u8]) {
        // SAFETY: state mutex held by caller.
        let data = unsafe { self.region_mut() };
        let mut idx = self.index(st.head);
        let mut rest = bytes;
        while !rest.is_empty() {
            let chunk = rest.len().min(self.nominal - idx);
            data[idx..idx + chunk].copy_from_slice(&rest[..chunk]);
            self.mirror(data, idx, chunk);
            if idx + chunk == self.nominal {
                st.wrapped = true;
            }
            rest = &rest[chunk..];
            idx = 0;
        }
        st.head += bytes.len() as u64;
        self.data_ready.notify_all();
    }

    /// Issue at most one bounded backend read into the ring.
    ///
    /// Caller must hold the state mutex. The backend read is the only
    /// blocking call made under the lock, and it is abortable.
    fn fill_once(&self, st: &mut FillState) -> FillStep {
        if st.failed {
            return FillStep::Failed;
        }
        if st.eof {
            return FillStep::Eof;
        }

        let free = self.free_bytes(st);
        if free == 0 {
            return FillStep::NoSpace;
        }

        let idx = self.index(st.head);
        let mut want = free.min(self.nominal - idx).min(self.cfg.max_read_burst);
        if let Some(end) = self.cfg.end_offset {
            let remaining = end.saturating_sub(st.head);
            if remaining == 0 {
                st.eof = true;
                self.data_ready.notify_all();
                return FillStep::Eof;
            }
            want = want.min(remaining.min(usize::MAX as u64) as usize);
        }
        if want == 0 {
            return FillStep::NoSpace;
        }

        let outcome = {
            let Some(io) = st.io.as_mut() else {
                // Externally fed buffer; nothing to pull.
                return FillStep::NoSpace;
            };
            // SAFETY: state mutex held; the io read borrows a disjoint
            // field of the same state.
            let data = unsafe { self.region_mut() };
            io.read(&mut data[idx..idx + want], &self.abort)
        };

        match outcome {
            ReadOutcome::Data(n) => {
                // SAFETY: state mutex held.
                let data = unsafe { self.region_mut() };
                self.mirror(data, idx, n);
                if idx + n == self.nominal {
                    st.wrapped = true;
                }
                st.head += n as u64;
                if self.cfg.end_offset == Some(st.head) {
                    debug!(head = st.head, "reached declared end of data");
                    st.eof = true;
                }
                self.data_ready.notify_all();
                FillStep::Filled
            }
            ReadOutcome::NotReady => FillStep::NotReady,
            ReadOutcome::Eof => {
                debug!(head = st.head, "backend reports end of data");
                st.eof = true;
                self.data_ready.notify_all();
                FillStep::Eof
            }
            ReadOutcome::Aborted(kind) => {
                trace!(?kind, "backend read aborted");
                FillStep::Aborted(kind)
            }
            ReadOutcome::Failed(e) => {
                error!(error = %e, "backend read failed; latching stream error");
                st.failed = true;
                st.error = Some(e);
                self.data_ready.notify_all();
                FillStep::Failed
            }
        }
    }

    /// Decide whether the device may go to sleep after a fill.
    fn maybe_sleep(&self, st: &mut FillState) {
        if st.sleeping {
            return;
        }
        let sleepable = st.io.as_ref().is_some_and(|io| io.is_sleepable());
        if !sleepable {
            return;
        }
        if let Some(ms) = st.rate.predicted_ms(st.buffered()) {
            if ms >= self.cfg.wake_awake_ms {
                debug!(buffered_ms = ms, "enough runway buffered; device may sleep");
                st.sleeping = true;
            }
        }
    }
}

/// Background fill loop: one OS thread per open buffer.
fn fill_loop(shared: Arc<Shared>) {
    debug!("fill thread started");
    while shared.running.load(Ordering::Acquire) {
        let mut st = shared.state.lock().unwrap();

        if st.failed || st.eof {
            let _unused = shared.space_free.wait_timeout(st, IDLE_WAIT).unwrap();
            continue;
        }

        if st.sleeping {
            let runway = st.rate.predicted_ms(st.buffered());
            if runway.is_some_and(|ms| ms > shared.cfg.wake_asleep_ms) {
                // Plenty left; let consumption drain before spinning the
                // device back up.
                let _unused = shared.space_free.wait_timeout(st, IDLE_WAIT).unwrap();
                continue;
            }
            debug!(buffered_ms = ?runway, "waking device to refill");
            st.sleeping = false;
        }

        match shared.fill_once(&mut st) {
            FillStep::Filled => {
                shared.maybe_sleep(&mut st);
            }
            FillStep::NoSpace => {
                let _unused = shared.space_free.wait_timeout(st, IDLE_WAIT).unwrap();
            }
            FillStep::NotReady => {
                let _unused = shared
                    .space_free
                    .wait_timeout(st, NOT_READY_BACKOFF)
                    .unwrap();
            }
            FillStep::Eof | FillStep::Failed => {}
            FillStep::Aborted(AbortKind::Current) => {}
            FillStep::Aborted(AbortKind::Final) => break,
        }
    }
    debug!("fill thread exiting");
}

/// The stream buffering engine.
///
/// See the [module documentation](self) for the overall model.
///
/// # Example
///
/// ```rust
/// use reservoir::config::{StorageMode, StreamConfig};
/// use reservoir::io::MemoryIo;
/// use reservoir::stream::StreamBuffer;
///
/// let io = MemoryIo::counting(64 * 1024);
/// let cfg = StreamConfig {
///     buffer_size: 16 * 1024,
///     overlap_size: 1024,
///     storage: StorageMode::Heap,
///     ..StreamConfig::default()
/// };
/// let mut buf = StreamBuffer::open(Some(Box::new(io)), cfg).unwrap();
///
/// let mut packet = [0u8; 256];
/// assert!(buf.wait_data(packet.len(), std::time::Duration::from_secs(1)));
/// buf.read(&mut packet).unwrap();
/// buf.close();
/// ```
pub struct StreamBuffer {
    shared: Arc<Shared>,
    fill_thread: Option<JoinHandle<()>>,
    closed: bool,
}

impl StreamBuffer {
    /// Open a stream buffer.
    ///
    /// Selects storage per the config, starts the fill thread when a
    /// backend is present, and blocks until the overlap or the minimum
    /// parse watermark is buffered (or the stream ends first).
    ///
    /// # Errors
    ///
    /// `AllocationFailed` if storage cannot be provided, `IoOpen` if the
    /// backend refuses to open or position, or the backend's own error if
    /// the initial fill fails.
    pub fn open(io: Option<Box<dyn MediaIo>>, cfg: StreamConfig) -> Result<Self> {
        cfg.validate()?;

        let total = cfg.buffer_size + cfg.overlap_size;
        let region = match &cfg.storage {
            StorageMode::Heap => RegionHandle::from_region(Arc::new(HeapRegion::new(total)?)),
            StorageMode::AnonMap => {
                let region = AnonRegion::new("reservoir-stream", total)?;
                region.prefault();
                RegionHandle::from_region(Arc::new(region))
            }
            StorageMode::SwapFile => {
                RegionHandle::from_region(Arc::new(SwapFileRegion::new(total)?))
            }
            StorageMode::Borrowed(handle) => {
                if handle.len() <= cfg.overlap_size + 1 {
                    return Err(Error::AllocationFailed(
                        "borrowed region too small for the overlap".into(),
                    ));
                }
                handle.clone()
            }
        };
        let nominal = region.len() - cfg.overlap_size;

        let mut io = io;
        let mut head = cfg.start_offset;
        if let Some(io) = io.as_mut() {
            io.open(OpenMode::Read)?;
            // A fresh backend is already positioned at zero; only seek
            // when playback starts mid-stream.
            if cfg.start_offset > 0 {
                let reached = io
                    .seek(cfg.start_offset)
                    .map_err(|e| Error::IoOpen(e.to_string()))?;
                if reached > cfg.start_offset {
                    return Err(Error::IoOpen(format!(
                        "backend cannot position at {}, reports {}",
                        cfg.start_offset, reached
                    )));
                }
                head = reached;
            }
        }
        let has_io = io.is_some();

        debug!(
            buffer = nominal,
            overlap = cfg.overlap_size,
            start = cfg.start_offset,
            storage = ?region.kind(),
            "opening stream buffer"
        );

        let shared = Arc::new(Shared {
            state: Mutex::new(FillState {
                io,
                head,
                scan: cfg.start_offset,
                watermarks: [None; 3],
                eof: false,
                wrapped: false,
                sleeping: false,
                failed: false,
                error: None,
                rate: RateEstimator::new(),
            }),
            data_ready: Condvar::new(),
            space_free: Condvar::new(),
            running: AtomicBool::new(true),
            abort: AbortFlag::new(),
            region,
            nominal,
            overlap: cfg.overlap_size,
            cfg: cfg.clone(),
        });

        let fill_thread = if has_io {
            let thread_shared = Arc::clone(&shared);
            Some(
                std::thread::Builder::new()
                    .name("reservoir-fill".into())
                    .spawn(move || fill_loop(thread_shared))?,
            )
        } else {
            None
        };

        let mut buf = Self {
            shared,
            fill_thread,
            closed: false,
        };

        if has_io {
            let preroll = cfg.overlap_size.min(cfg.min_parse_size);
            if let Err(e) = buf.wait_preroll(preroll) {
                buf.close();
                return Err(e);
            }
        }
        Ok(buf)
    }

    fn wait_preroll(&self, target: usize) -> Result<()> {
        let mut st = self.shared.state.lock().unwrap();
        loop {
            if st.failed {
                return Err(st.error.take().unwrap_or(Error::Faulted));
            }
            if st.eof || st.buffered() >= target as u64 {
                return Ok(());
            }
            let (guard, _) = self
                .shared
                .data_ready
                .wait_timeout(st, IDLE_WAIT)
                .unwrap();
            st = guard;
        }
    }

    /// Ring capacity in bytes (excluding the overlap mirror).
    pub fn capacity(&self) -> usize {
        self.shared.nominal
    }

    /// Size of the overlap mirror.
    pub fn overlap(&self) -> usize {
        self.shared.overlap
    }

    /// Absolute position of the newest buffered byte.
    pub fn head_pos(&self) -> u64 {
        self.shared.state.lock().unwrap().head
    }

    /// Absolute position of the oldest byte still needed by any stream.
    pub fn tail_pos(&self) -> u64 {
        self.shared.state.lock().unwrap().tail()
    }

    /// Absolute position of the scan cursor.
    pub fn scan_pos(&self) -> u64 {
        self.shared.state.lock().unwrap().scan
    }

    /// Bytes buffered ahead of the scan cursor.
    pub fn used(&self) -> usize {
        self.shared.state.lock().unwrap().buffered() as usize
    }

    /// True once the write position reached the declared end or the
    /// backend reported end of data.
    pub fn is_eof(&self) -> bool {
        self.shared.state.lock().unwrap().eof
    }

    /// True once the fill has wrapped around the ring at least once.
    pub fn has_wrapped(&self) -> bool {
        self.shared.state.lock().unwrap().wrapped
    }

    /// True while the power policy keeps the device asleep.
    pub fn is_sleeping(&self) -> bool {
        self.shared.state.lock().unwrap().sleeping
    }

    /// True once a stream-fatal error has been latched.
    pub fn is_faulted(&self) -> bool {
        self.shared.state.lock().unwrap().failed
    }

    /// Take the latched stream-fatal error, if any. The faulted state
    /// itself remains.
    pub fn take_error(&self) -> Option<Error> {
        self.shared.state.lock().unwrap().error.take()
    }

    /// Copy buffered bytes out at the scan cursor and advance it.
    ///
    /// # Errors
    ///
    /// `InsufficientData` if fewer than `out.len()` bytes are buffered
    /// (`Faulted` instead once a stream error is latched).
    pub fn read(&self, out: &mut [u8]) -> Result<()> {
        let mut st = self.shared.state.lock().unwrap();
        if (out.len() as u64) > st.buffered() {
            return Err(if st.failed {
                Error::Faulted
            } else {
                Error::InsufficientData
            });
        }
        // SAFETY: state mutex held.
        let data = unsafe { self.shared.region_ref() };
        let idx = self.shared.index(st.scan);
        let first = out.len().min(self.shared.nominal - idx);
        out[..first].copy_from_slice(&data[idx..idx + first]);
        if first < out.len() {
            let rest = out.len() - first;
            out[first..].copy_from_slice(&data[..rest]);
        }
        st.scan += out.len() as u64;
        st.rate.note_consumed(out.len());
        self.shared.space_free.notify_all();
        Ok(())
    }

    /// Advance the scan cursor without copying.
    ///
    /// # Errors
    ///
    /// `InsufficientData` if fewer than `count` bytes are buffered.
    pub fn skip(&self, count: usize) -> Result<()> {
        let mut st = self.shared.state.lock().unwrap();
        if (count as u64) > st.buffered() {
            return Err(if st.failed {
                Error::Faulted
            } else {
                Error::InsufficientData
            });
        }
        st.scan += count as u64;
        st.rate.note_consumed(count);
        self.shared.space_free.notify_all();
        Ok(())
    }

    /// Return the byte at `offset` past the scan cursor without consuming.
    ///
    /// # Errors
    ///
    /// `InsufficientData` if the byte is not buffered.
    pub fn peek_byte(&self, offset: usize) -> Result<u8> {
        let st = self.shared.state.lock().unwrap();
        if (offset as u64) >= st.buffered() {
            return Err(Error::InsufficientData);
        }
        // SAFETY: state mutex held.
        let data = unsafe { self.shared.region_ref() };
        Ok(data[self.shared.index(st.scan + offset as u64)])
    }

    /// Run `f` over a contiguous view of `len` buffered bytes at the scan
    /// cursor, using the overlap mirror to cross the wrap point.
    ///
    /// # Errors
    ///
    /// `InsufficientData` if fewer than `len` bytes are buffered or the
    /// window would reach past the mirror (fall back to
    /// [`read`](StreamBuffer::read)).
    pub fn read_window<R>(&self, len: usize, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let st = self.shared.state.lock().unwrap();
        if (len as u64) > st.buffered() {
            return Err(Error::InsufficientData);
        }
        let idx = self.shared.index(st.scan);
        if idx + len > self.shared.nominal + self.shared.overlap {
            return Err(Error::InsufficientData);
        }
        // SAFETY: state mutex held.
        let data = unsafe { self.shared.region_ref() };
        Ok(f(&data[idx..idx + len]))
    }

    /// Wait until at least `len` bytes are buffered.
    ///
    /// Returns false on timeout, end of data, or a latched error. The
    /// wait is signalled by fill completion, so there is no polling.
    pub fn wait_data(&self, len: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut st = self.shared.state.lock().unwrap();
        loop {
            if st.buffered() >= len as u64 {
                return true;
            }
            if st.eof || st.failed {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (guard, _) = self
                .shared
                .data_ready
                .wait_timeout(st, remaining)
                .unwrap();
            st = guard;
        }
    }

    /// Append bytes at the head. Producer API for buffers opened without
    /// a backend (externally fed, e.g. from a sibling pipeline).
    ///
    /// # Errors
    ///
    /// `InsufficientSpace` if the bytes do not fit ahead of the tail.
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        let mut st = self.shared.state.lock().unwrap();
        if bytes.len() > self.shared.free_bytes(&st) {
            return Err(Error::InsufficientSpace);
        }
        self.shared.push_bytes(&mut st, bytes);
        Ok(())
    }

    /// Reposition the scan cursor.
    ///
    /// If the target is still buffered (and `force_reload` is false) the
    /// cursors adjust in place with zero I/O. Otherwise the buffer
    /// reloads: cursors and watermarks reset to the target (block-aligned
    /// for block devices) and the fill is driven synchronously until the
    /// demuxer can make progress.
    ///
    /// # Errors
    ///
    /// `Faulted` once a stream error is latched; `IoRead` if the backend
    /// cannot satisfy the reload; `SeekInconsistency` if the backend lands
    /// past the requested position (stream-fatal, never retried).
    pub fn seek(&self, target: u64, force_reload: bool) -> Result<()> {
        let st = self.shared.state.lock().unwrap();
        if st.failed {
            return Err(Error::Faulted);
        }
        if !force_reload && target >= st.tail() && target <= st.head {
            return self.seek_in_place(st, target);
        }
        self.reload(st, target)
    }

    /// Non-blocking seek variant: asks the fill thread to abandon its
    /// in-flight read ("this operation only") before taking the lock,
    /// bounding seek latency on slow backends.
    pub fn seek_interrupt(&self, target: u64, force_reload: bool) -> Result<()> {
        self.shared.abort.request_current();
        self.seek(target, force_reload)
    }

    fn seek_in_place(&self, mut st: MutexGuard<'_, FillState>, target: u64) -> Result<()> {
        if target == st.scan {
            trace!(target, "seek to current scan position");
            return Ok(());
        }
        debug!(target, scan = st.scan, "in-buffer seek");
        st.scan = target;
        st.rate.restart_window();
        self.shared.space_free.notify_all();
        Ok(())
    }

    fn reload(&self, mut st: MutexGuard<'_, FillState>, target: u64) -> Result<()> {
        if st.io.is_none() {
            return Err(Error::IoRead(
                "seek outside buffered data with no backend".into(),
            ));
        }

        let aligned = match self.shared.cfg.block_align {
            Some(align) => target - (target % align as u64),
            None => target,
        };
        debug!(target, aligned, "reloading stream buffer");

        let reached = {
            let io = st.io.as_mut().unwrap();
            io.seek(aligned)
        };
        let reached = match reached {
            Ok(pos) => pos,
            Err(e) => {
                let msg = e.to_string();
                warn!(error = %msg, "backend seek failed");
                st.failed = true;
                st.error = Some(Error::IoRead(msg.clone()));
                self.shared.data_ready.notify_all();
                return Err(Error::IoRead(msg));
            }
        };
        if reached > aligned {
            // The backend landed past where it was asked to go. This is an
            // accounting or driver bug, not a transient condition.
            error!(
                expected = aligned,
                actual = reached,
                "seek reload overshot its target"
            );
            st.failed = true;
            st.error = Some(Error::SeekInconsistency {
                expected: aligned,
                actual: reached,
            });
            self.shared.data_ready.notify_all();
            return Err(Error::SeekInconsistency {
                expected: aligned,
                actual: reached,
            });
        }

        st.head = reached;
        st.scan = target;
        st.eof = false;
        st.wrapped = false;
        st.rate.restart_window();
        for mark in st.watermarks.iter_mut() {
            if mark.is_some() {
                *mark = Some(target);
            }
        }

        // Drive the fill synchronously until the demuxer can make forward
        // progress (or the stream ends first).
        let need = self.shared.overlap.min(self.shared.cfg.min_parse_size) as u64;
        loop {
            if st.failed {
                return Err(st.error.take().unwrap_or(Error::Faulted));
            }
            if st.eof || st.buffered() >= need {
                break;
            }
            match self.shared.fill_once(&mut st) {
                FillStep::Filled | FillStep::Aborted(AbortKind::Current) => {}
                FillStep::NotReady => {
                    let (guard, _) = self
                        .shared
                        .data_ready
                        .wait_timeout(st, NOT_READY_BACKOFF)
                        .unwrap();
                    st = guard;
                }
                FillStep::NoSpace => return Err(Error::InsufficientSpace),
                FillStep::Eof | FillStep::Failed => {}
                FillStep::Aborted(AbortKind::Final) => return Err(Error::Closed),
            }
        }
        self.shared.space_free.notify_all();
        Ok(())
    }

    /// Record that `kind` has consumed the stream through `consumed_through`.
    ///
    /// The tail (reclaim floor) is the minimum over the active streams'
    /// watermarks; memory behind it becomes writable for the fill thread.
    pub fn free_data(&self, kind: StreamKind, consumed_through: u64) {
        let mut st = self.shared.state.lock().unwrap();
        st.watermarks[kind.index()] = Some(consumed_through);
        self.shared.space_free.notify_all();
    }

    /// Remove `kind` from reclaim accounting (its track ended or was
    /// deselected) so an inactive stream never pins the tail.
    pub fn retire_stream(&self, kind: StreamKind) {
        let mut st = self.shared.state.lock().unwrap();
        st.watermarks[kind.index()] = None;
        self.shared.space_free.notify_all();
    }

    /// Stop the fill thread, close the backend, and release the storage.
    ///
    /// Idempotent; also invoked on drop. The throwaway swap file (if that
    /// storage mode was selected) disappears with the region.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        debug!("closing stream buffer");

        self.shared.running.store(false, Ordering::Release);
        self.shared.abort.request_final();
        self.shared.data_ready.notify_all();
        self.shared.space_free.notify_all();
        if let Some(handle) = self.fill_thread.take() {
            let _ = handle.join();
        }
        let mut st = self.shared.state.lock().unwrap();
        if let Some(mut io) = st.io.take() {
            io.close();
        }
    }
}

impl Drop for StreamBuffer {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for StreamBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.shared.state.lock().unwrap();
        f.debug_struct("StreamBuffer")
            .field("capacity", &self.shared.nominal)
            .field("overlap", &self.shared.overlap)
            .field("head", &st.head)
            .field("scan", &st.scan)
            .field("tail", &st.tail())
            .field("eof", &st.eof)
            .field("failed", &st.failed)
            .finish()
    }
}
