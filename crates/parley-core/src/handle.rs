//! A cloneable handle on the turn in flight.

use parking_lot::Mutex;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio_util::sync::CancellationToken;

/// A cloneable handle for aborting or awaiting the turn in flight.
///
/// At most one turn runs at a time: [`TurnHandle::try_begin`] is the
/// cooperative lock taken by every send. All fields are `Arc`-wrapped, so
/// cloning is cheap.
#[derive(Clone)]
pub struct TurnHandle {
    cancel: Arc<Mutex<CancellationToken>>,
    idle_notify: Arc<tokio::sync::Notify>,
    is_running: Arc<AtomicBool>,
}

impl Default for TurnHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnHandle {
    pub fn new() -> Self {
        Self {
            cancel: Arc::new(Mutex::new(CancellationToken::new())),
            idle_notify: Arc::new(tokio::sync::Notify::new()),
            is_running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Claim the turn slot.
    ///
    /// Returns a fresh cancellation token for the new turn, or `None` if a
    /// turn is already running.
    pub(crate) fn try_begin(&self) -> Option<CancellationToken> {
        if self
            .is_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        let token = CancellationToken::new();
        *self.cancel.lock() = token.clone();
        Some(token)
    }

    /// Release the turn slot and wake idle waiters
    pub(crate) fn finish(&self) {
        self.is_running.store(false, Ordering::Release);
        self.idle_notify.notify_waiters();
    }

    /// Abort the current turn. A no-op when idle.
    pub fn abort(&self) {
        self.cancel.lock().cancel();
    }

    /// Wait until no turn is running.
    pub async fn wait_for_idle(&self) {
        let notified = self.idle_notify.notified();
        if !self.is_running.load(Ordering::Acquire) {
            return;
        }
        notified.await;
    }

    /// Wait until idle, with a timeout.
    /// Returns `true` if idle was reached, `false` on timeout.
    pub async fn wait_for_idle_timeout(&self, timeout: std::time::Duration) -> bool {
        if !self.is_running.load(Ordering::Acquire) {
            return true;
        }
        tokio::time::timeout(timeout, self.wait_for_idle())
            .await
            .is_ok()
    }

    /// Whether a turn is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }
}
