use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

/// Cooperative stop signal shared between the Ctrl+C handler and the running stages.
///
/// Stages only look at it at their own safe points (between batches, between items,
/// inside delays); nothing in flight is preempted.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    requested: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop. Returns true if one had already been requested.
    pub fn trigger(&self) -> bool {
        let already = self.requested.swap(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        already
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` unless a stop is requested first.
    /// Returns false when the sleep was cut short.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable(); // register before checking the flag so no wakeup is lost

        if self.is_requested() {
            return false;
        }
        if duration.is_zero() {
            return true;
        }

        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = notified => false,
        }
    }

    /// Resolves once a stop has been requested.
    pub async fn cancelled(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if !self.is_requested() {
            notified.await;
        }
    }
}
