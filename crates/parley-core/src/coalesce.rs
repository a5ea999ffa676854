//! Render coalescing for streamed message content.
//!
//! Text deltas arrive far more often than anyone can look at them. The
//! [`RenderCoalescer`] keeps only the latest accumulated content and writes it
//! to the store at most once per frame. The final write cancels any pending
//! frame, so a stale frame can never land after the message is finalized.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::store::ConversationStore;

/// Default frame interval (about 60 frames per second)
pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(16);

/// Work to run on the next frame
pub type FrameCallback = Box<dyn FnOnce() + Send + 'static>;

/// Handle on a requested frame
#[derive(Debug, Clone, Default)]
pub struct FrameHandle {
    token: CancellationToken,
}

impl FrameHandle {
    /// Prevent the frame callback from running. A no-op if it already ran.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Source of render frames.
///
/// Implementations must never run the callback inline from `request_frame`.
pub trait FrameScheduler: Send + Sync {
    /// Schedule `callback` for the next frame
    fn request_frame(&self, callback: FrameCallback) -> FrameHandle;
}

/// Frames driven by the tokio timer
#[derive(Debug, Clone)]
pub struct IntervalFrames {
    interval: Duration,
}

impl IntervalFrames {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl Default for IntervalFrames {
    fn default() -> Self {
        Self::new(DEFAULT_FRAME_INTERVAL)
    }
}

impl FrameScheduler for IntervalFrames {
    fn request_frame(&self, callback: FrameCallback) -> FrameHandle {
        let handle = FrameHandle::default();
        let token = handle.token.clone();
        let interval = self.interval;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(interval) => {
                    if !token.is_cancelled() {
                        callback();
                    }
                }
            }
        });
        handle
    }
}

/// Frames fired explicitly by the caller
#[derive(Clone, Default)]
pub struct ManualFrames {
    queue: Arc<Mutex<Vec<(FrameHandle, FrameCallback)>>>,
}

impl ManualFrames {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run every frame requested so far. Returns how many callbacks ran.
    pub fn fire(&self) -> usize {
        let due = std::mem::take(&mut *self.queue.lock());
        let mut fired = 0;
        for (handle, callback) in due {
            if !handle.is_cancelled() {
                callback();
                fired += 1;
            }
        }
        fired
    }

    /// Number of requested frames that are still live
    pub fn pending(&self) -> usize {
        self.queue
            .lock()
            .iter()
            .filter(|(handle, _)| !handle.is_cancelled())
            .count()
    }
}

impl FrameScheduler for ManualFrames {
    fn request_frame(&self, callback: FrameCallback) -> FrameHandle {
        let handle = FrameHandle::default();
        self.queue.lock().push((handle.clone(), callback));
        handle
    }
}

#[derive(Default)]
struct CoalescerState {
    pending: Option<String>,
    scheduled: Option<FrameHandle>,
    finished: bool,
    frames_written: usize,
}

struct CoalescerInner {
    store: Arc<ConversationStore>,
    message_id: String,
    frames: Arc<dyn FrameScheduler>,
    state: Mutex<CoalescerState>,
}

impl CoalescerInner {
    fn flush_frame(&self) {
        let mut state = self.state.lock();
        state.scheduled = None;
        if state.finished {
            return;
        }
        if let Some(content) = state.pending.take() {
            // store writes happen under our lock so `finish` can't interleave
            match self.store.set_streaming_content(&self.message_id, content) {
                Ok(()) => state.frames_written += 1,
                Err(e) => tracing::debug!("Dropped frame for {}: {}", self.message_id, e),
            }
        }
    }
}

/// Coalesces streamed content of one message into frame-paced store writes
pub struct RenderCoalescer {
    inner: Arc<CoalescerInner>,
}

impl RenderCoalescer {
    pub fn new(
        store: Arc<ConversationStore>,
        message_id: impl Into<String>,
        frames: Arc<dyn FrameScheduler>,
    ) -> Self {
        Self {
            inner: Arc::new(CoalescerInner {
                store,
                message_id: message_id.into(),
                frames,
                state: Mutex::new(CoalescerState::default()),
            }),
        }
    }

    /// The message this coalescer writes to
    pub fn message_id(&self) -> &str {
        &self.inner.message_id
    }

    /// Record the latest accumulated content; written on the next frame
    pub fn commit(&self, content: impl Into<String>) {
        let mut state = self.inner.state.lock();
        if state.finished {
            return;
        }
        state.pending = Some(content.into());
        if state.scheduled.is_none() {
            let weak: Weak<CoalescerInner> = Arc::downgrade(&self.inner);
            let handle = self.inner.frames.request_frame(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.flush_frame();
                }
            }));
            state.scheduled = Some(handle);
        }
    }

    /// Cancel any pending frame and write the final content.
    ///
    /// After this returns no frame write for the message can happen.
    pub fn finish(&self, content: impl Into<String>) -> Result<()> {
        let mut state = self.inner.state.lock();
        state.finished = true;
        state.pending = None;
        if let Some(handle) = state.scheduled.take() {
            handle.cancel();
        }
        self.inner
            .store
            .update_message_content(&self.inner.message_id, content)
    }

    /// Number of frames that reached the store
    pub fn frames_written(&self) -> usize {
        self.inner.state.lock().frames_written
    }
}

impl Drop for RenderCoalescer {
    fn drop(&mut self) {
        if let Some(handle) = self.inner.state.lock().scheduled.take() {
            handle.cancel();
        }
    }
}
