//! Per-layer incoming buffer stream.
//!
//! A frame source is a bounded FIFO of producer buffers. Every accepted
//! buffer receives the next frame number; numbers start at 1 and are never
//! reused. Latching moves queued frames into the committed slot.

use crate::buffer::GraphicBuffer;
use common::error::{CompositorError, CompositorResult};
use std::collections::VecDeque;
use std::sync::Arc;

/// Monotonic sequence id of a submitted buffer.
pub type FrameNumber = u64;

/// A submitted buffer waiting to be latched.
#[derive(Clone, Debug)]
pub struct QueuedFrame {
    pub frame_number: FrameNumber,
    pub buffer: Arc<GraphicBuffer>,
}

/// Outcome of [`FrameSource::try_commit_up_to`].
#[derive(Clone, Debug, Default)]
pub struct FrameLatch {
    /// Newest buffer committed by this call, if any frame was queued.
    pub buffer: Option<Arc<GraphicBuffer>>,
    /// Frame number committed after the call.
    pub committed_frame_number: FrameNumber,
    /// Whether the committed frame number reached the requested target.
    pub reached: bool,
}

#[derive(Debug)]
pub struct FrameSource {
    last_submitted: FrameNumber,
    committed: FrameNumber,
    queue: VecDeque<QueuedFrame>,
    capacity: usize,
}

impl FrameSource {
    pub fn new(capacity: usize) -> Self {
        Self {
            last_submitted: 0,
            committed: 0,
            queue: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Number the next submitted buffer will receive.
    pub fn next_frame_number(&self) -> FrameNumber {
        self.last_submitted + 1
    }

    /// Highest frame number accepted into the committed slot.
    pub fn committed_frame_number(&self) -> FrameNumber {
        self.committed
    }

    /// Number of submitted frames not yet latched.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Enqueues a buffer. A full queue rejects the buffer without consuming
    /// a frame number.
    pub fn submit(&mut self, buffer: Arc<GraphicBuffer>) -> CompositorResult<FrameNumber> {
        if self.queue.len() >= self.capacity {
            return Err(CompositorError::out_of_resources(format!(
                "frame queue full ({} frames pending)",
                self.queue.len()
            )));
        }

        self.last_submitted += 1;
        let frame_number = self.last_submitted;
        self.queue.push_back(QueuedFrame {
            frame_number,
            buffer,
        });

        Ok(frame_number)
    }

    /// Commits every queued frame and reports whether `target` was reached.
    pub fn try_commit_up_to(&mut self, target: FrameNumber) -> FrameLatch {
        let mut latched = None;
        while let Some(frame) = self.queue.pop_front() {
            self.committed = frame.frame_number;
            latched = Some(frame.buffer);
        }

        FrameLatch {
            buffer: latched,
            committed_frame_number: self.committed,
            reached: self.committed >= target,
        }
    }

    /// Whether `target` has already been committed.
    pub fn has_reached(&self, target: FrameNumber) -> bool {
        self.committed >= target
    }
}

impl Default for FrameSource {
    fn default() -> Self {
        Self::new(3)
    }
}
