//! Bounded-wait mutex acquisition with slow-lock diagnostics
//!
//! [`TimedMutex`] wraps a [`tokio::sync::Mutex`] and bounds how long an
//! acquisition may wait before emitting a diagnostic naming the call site.
//! After the diagnostic it falls back to an unbounded acquisition, so
//! correctness is never traded for observability: `lock()` always returns
//! holding the guard and never surfaces an error.
//!
//! The bound is a process-wide, mutable value so tests can shrink it to make
//! the diagnostic path reachable in bounded time.

use std::panic::Location;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, MutexGuard};
use tracing::warn;

/// Default acquisition bound before the slow-lock diagnostic fires.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(600);

static LOCK_TIMEOUT_MS: AtomicU64 = AtomicU64::new(600_000);

/// Set the process-wide acquisition bound.
pub fn set_lock_timeout(bound: Duration) {
    LOCK_TIMEOUT_MS.store(bound.as_millis() as u64, Ordering::Relaxed);
}

/// Current process-wide acquisition bound.
pub fn lock_timeout() -> Duration {
    Duration::from_millis(LOCK_TIMEOUT_MS.load(Ordering::Relaxed))
}

/// Mutex whose acquisitions emit a diagnostic when they exceed the
/// process-wide bound, then keep waiting.
#[derive(Debug, Default)]
pub struct TimedMutex<T> {
    inner: Mutex<T>,
    slow_locks: AtomicU64,
}

impl<T> TimedMutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
            slow_locks: AtomicU64::new(0),
        }
    }

    /// Acquire the lock, diagnosing waits longer than [`lock_timeout`].
    ///
    /// Blocks until the lock is held. If the bound elapses first, logs one
    /// warning with the caller's location and the configured bound, then
    /// waits without bound and logs the total wait once acquired.
    #[track_caller]
    pub fn lock(&self) -> impl std::future::Future<Output = MutexGuard<'_, T>> + '_ {
        let caller = Location::caller();
        async move {
            let bound = lock_timeout();
            match tokio::time::timeout(bound, self.inner.lock()).await {
                Ok(guard) => guard,
                Err(_) => {
                    self.slow_locks.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "{}:{}: waiting for lock > {:.3} s",
                        caller.file(),
                        caller.line(),
                        bound.as_secs_f64()
                    );
                    let resumed = Instant::now();
                    let guard = self.inner.lock().await;
                    warn!(
                        "lock acquired after {:.3} s",
                        bound.as_secs_f64() + resumed.elapsed().as_secs_f64()
                    );
                    guard
                }
            }
        }
    }

    /// Non-blocking acquisition attempt.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.inner.try_lock().ok()
    }

    /// Number of acquisitions on this mutex that ran past the bound.
    pub fn slow_lock_count(&self) -> u64 {
        self.slow_locks.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};

    // Serializes tests that mutate the process-wide bound.
    static TIMEOUT_GUARD: StdMutex<()> = StdMutex::new(());

    #[tokio::test]
    async fn uncontended_lock_is_silent() {
        let mutex = TimedMutex::new(1u32);
        {
            let guard = mutex.lock().await;
            assert_eq!(*guard, 1);
        }
        assert_eq!(mutex.slow_lock_count(), 0);
    }

    #[tokio::test]
    async fn zero_bound_on_contended_lock_diagnoses_exactly_once() {
        let _serial = TIMEOUT_GUARD.lock().unwrap();
        set_lock_timeout(Duration::ZERO);

        let mutex = Arc::new(TimedMutex::new(0u32));
        let held = mutex.clone();
        let guard = held.lock().await;

        let contender = mutex.clone();
        let waiter = tokio::spawn(async move {
            let mut guard = contender.lock().await;
            *guard += 1;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);
        waiter.await.unwrap();

        set_lock_timeout(DEFAULT_LOCK_TIMEOUT);

        // The contended acquisition fired the diagnostic path once and
        // still ended up holding the lock.
        assert_eq!(mutex.slow_lock_count(), 1);
        assert_eq!(*mutex.lock().await, 1);
    }

    #[tokio::test]
    async fn try_lock_reports_contention() {
        let mutex = TimedMutex::new(());
        let guard = mutex.try_lock();
        assert!(guard.is_some());
        assert!(mutex.try_lock().is_none());
        drop(guard);
        assert!(mutex.try_lock().is_some());
    }

    #[test]
    fn timeout_is_process_wide() {
        let _serial = TIMEOUT_GUARD.lock().unwrap();
        set_lock_timeout(Duration::from_secs(5));
        assert_eq!(lock_timeout(), Duration::from_secs(5));
        set_lock_timeout(DEFAULT_LOCK_TIMEOUT);
        assert_eq!(lock_timeout(), DEFAULT_LOCK_TIMEOUT);
    }
}
