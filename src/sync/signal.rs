//! Single-slot wait/signal rendezvous
//!
//! [`Signal`] carries at most one pending wake. Raising it while a wake is
//! already pending coalesces into a single wake: a producer that raises
//! twice before the consumer waits once loses the second "event". That is
//! the intended edge-triggered semantic, not a defect; callers needing
//! counted events want a channel instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Condition-style notification with one pending-signal slot.
#[derive(Debug, Default)]
pub struct Signal {
    pending: AtomicBool,
    notify: Notify,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pending flag and wake at most one waiter.
    pub fn raise(&self) {
        self.pending.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    /// Block until a signal is pending, then consume it.
    pub async fn wait(&self) {
        loop {
            if self.pending.swap(false, Ordering::Acquire) {
                return;
            }
            self.notify.notified().await;
        }
    }

    /// Like [`wait`](Self::wait), bounded. Returns whether a signal was
    /// consumed before the bound elapsed.
    pub async fn wait_timeout(&self, bound: Duration) -> bool {
        tokio::time::timeout(bound, self.wait()).await.is_ok()
    }
}
