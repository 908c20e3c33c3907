//! Decoded-frame arena and the handoff queue between pipeline stages.
//!
//! Frames live in a [`FrameArena`] and are referred to everywhere else by
//! [`FrameId`]. Each frame carries an explicit owning-stage tag; moving a
//! frame between stages is a checked transition, so a frame can never be
//! written by the decoder while the renderer still reads it. The
//! [`FrameQueue`] passes ids from decode to render and supports
//! head-reinsertion for a frame that failed to render and must be
//! delivered again first.

use crate::error::{Error, Result};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// Index of a frame within its arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(usize);

impl FrameId {
    /// Arena slot index.
    pub fn index(self) -> usize {
        self.0
    }
}

/// The pipeline stage currently owning a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStage {
    /// In the free pool, ready for the decoder to claim.
    Free,
    /// Being written by the decoder.
    Decoder,
    /// Being converted (pixel format / scaling).
    Converter,
    /// Held by the renderer.
    Renderer,
    /// Sitting in a frame queue between stages.
    Queued,
}

/// One plane of a decoded frame (luma, chroma, or packed).
pub struct FramePlane {
    data: Box<[u8]>,
    stride: usize,
}

impl FramePlane {
    /// Allocate a zeroed plane.
    pub fn new(size: usize, stride: usize) -> Self {
        Self {
            data: vec![0u8; size].into_boxed_slice(),
            stride,
        }
    }

    /// Plane bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable plane bytes.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Bytes per row.
    pub fn stride(&self) -> usize {
        self.stride
    }
}

/// A decoded video frame.
pub struct VideoFrame {
    planes: Vec<FramePlane>,
    /// Presentation timestamp in stream time units.
    pub pts: Option<u64>,
    /// Display duration in stream time units.
    pub duration: Option<u64>,
    /// How long the decoder spent producing this frame.
    pub decode_time: Option<Duration>,
    /// Held by hardware (e.g. the display controller scans it out);
    /// must not be recycled while set.
    pub locked: bool,
    stage: FrameStage,
}

impl VideoFrame {
    fn new(planes: Vec<FramePlane>) -> Self {
        Self {
            planes,
            pts: None,
            duration: None,
            decode_time: None,
            locked: false,
            stage: FrameStage::Free,
        }
    }

    /// The frame's planes.
    pub fn planes(&self) -> &[FramePlane] {
        &self.planes
    }

    /// Mutable access to the frame's planes.
    pub fn planes_mut(&mut self) -> &mut [FramePlane] {
        &mut self.planes
    }

    /// The stage currently owning this frame.
    pub fn stage(&self) -> FrameStage {
        self.stage
    }

    /// Clear timing metadata when the frame returns to the free pool.
    pub fn reset(&mut self) {
        self.pts = None;
        self.duration = None;
        self.decode_time = None;
    }
}

/// Fixed pool of frames addressed by [`FrameId`].
///
/// The arena owns every frame buffer for the lifetime of playback; queues
/// and stages only ever hold ids. Allocation happens once at pipeline
/// setup, so the decode loop never touches the allocator.
pub struct FrameArena {
    frames: Vec<VideoFrame>,
}

impl FrameArena {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self { frames: Vec::new() }
    }

    /// Create an arena of `count` frames, each with the given
    /// `(size, stride)` planes.
    pub fn with_frames(count: usize, plane_layout: &[(usize, usize)]) -> Self {
        let frames = (0..count)
            .map(|_| {
                VideoFrame::new(
                    plane_layout
                        .iter()
                        .map(|&(size, stride)| FramePlane::new(size, stride))
                        .collect(),
                )
            })
            .collect();
        Self { frames }
    }

    /// Add a frame with the given planes; returns its id.
    pub fn alloc(&mut self, planes: Vec<FramePlane>) -> FrameId {
        self.frames.push(VideoFrame::new(planes));
        FrameId(self.frames.len() - 1)
    }

    /// Number of frames in the arena.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Returns true if the arena holds no frames.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Ids of all frames currently in the free pool.
    pub fn free_frames(&self) -> Vec<FrameId> {
        self.frames
            .iter()
            .enumerate()
            .filter(|(_, f)| f.stage == FrameStage::Free && !f.locked)
            .map(|(i, _)| FrameId(i))
            .collect()
    }

    /// Shared access to a frame.
    pub fn get(&self, id: FrameId) -> &VideoFrame {
        &self.frames[id.0]
    }

    /// Exclusive access to a frame.
    pub fn get_mut(&mut self, id: FrameId) -> &mut VideoFrame {
        &mut self.frames[id.0]
    }

    /// Move a frame from one owning stage to another.
    ///
    /// # Errors
    ///
    /// `FrameOwnership` if the frame is not currently owned by `from`;
    /// the frame is left untouched in that case.
    pub fn transition(&mut self, id: FrameId, from: FrameStage, to: FrameStage) -> Result<()> {
        let frame = &mut self.frames[id.0];
        if frame.stage != from {
            return Err(Error::FrameOwnership);
        }
        frame.stage = to;
        if to == FrameStage::Free {
            frame.reset();
        }
        Ok(())
    }
}

impl Default for FrameArena {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock-protected FIFO of frame ids with priority re-insertion.
///
/// The queue never blocks internally and holds ids only; frame storage
/// stays in the arena. Callers wanting to wait for a frame wrap the queue
/// in their own condition variable or backoff loop.
///
/// # Example
///
/// ```rust
/// use reservoir::frame::{FrameArena, FrameQueue, FrameStage};
///
/// let mut arena = FrameArena::with_frames(2, &[(1024, 64)]);
/// let queue = FrameQueue::new();
/// let id = arena.free_frames()[0];
///
/// arena.transition(id, FrameStage::Free, FrameStage::Queued).unwrap();
/// queue.put(id);
/// assert_eq!(queue.get(), Some(id));
/// ```
pub struct FrameQueue {
    order: Mutex<VecDeque<FrameId>>,
}

impl FrameQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            order: Mutex::new(VecDeque::new()),
        }
    }

    /// Append a frame at the tail.
    pub fn put(&self, id: FrameId) {
        self.order.lock().unwrap().push_back(id);
    }

    /// Insert a frame at the head, ahead of everything queued.
    ///
    /// Used to redeliver a frame after a failed or partial render.
    pub fn put_head(&self, id: FrameId) {
        self.order.lock().unwrap().push_front(id);
    }

    /// Pop the head frame, if any.
    pub fn get(&self) -> Option<FrameId> {
        self.order.lock().unwrap().pop_front()
    }

    /// The head frame without removing it.
    pub fn peek(&self) -> Option<FrameId> {
        self.order.lock().unwrap().front().copied()
    }

    /// Number of queued frames.
    pub fn len(&self) -> usize {
        self.order.lock().unwrap().len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.order.lock().unwrap().is_empty()
    }

    /// Drain every queued id, in order, to the caller (typically to hand
    /// them back to the free pool around a seek).
    pub fn flush(&self) -> Vec<FrameId> {
        self.order.lock().unwrap().drain(..).collect()
    }
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new()
    }
}
