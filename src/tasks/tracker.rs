use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::metrics::TaskMetrics;

/// High bit of the state word; the remaining bits are the in-flight count.
const CLOSED: usize = 1 << (usize::BITS - 1);

/// Returned by [`TaskTracker::begin`] once the tracker has been closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("task tracker is closed; no new background work is accepted")]
pub struct TrackerClosed;

#[derive(Debug, Default)]
struct TrackerInner {
    state: AtomicUsize,
    idle: Notify,
}

/// Counts outstanding background tasks so shutdown can wait for all of them.
///
/// Registration happens through [`TaskTracker::begin`], which hands back a
/// [`TaskGuard`]. The count is released when the guard is dropped, so a task
/// that returns early, fails or panics still releases exactly once.
///
/// [`TaskTracker::close`] flips a flag stored in the same atomic word as the
/// count. A registration either lands before the close, and is then waited
/// for by [`TaskTracker::wait_all`], or fails with [`TrackerClosed`].
#[derive(Debug, Clone, Default)]
pub struct TaskTracker {
    inner: Arc<TrackerInner>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one task. Must run in the spawner, before the task starts.
    pub fn begin(&self) -> Result<TaskGuard, TrackerClosed> {
        let mut current = self.inner.state.load(Ordering::SeqCst);
        loop {
            if current & CLOSED != 0 {
                return Err(TrackerClosed);
            }
            match self.inner.state.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        TaskMetrics::record_begin();
        Ok(TaskGuard {
            inner: self.inner.clone(),
        })
    }

    /// Refuse every later registration. Returns `true` for the call that
    /// closed the tracker.
    pub fn close(&self) -> bool {
        let previous = self.inner.state.fetch_or(CLOSED, Ordering::SeqCst);
        previous & CLOSED == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.load(Ordering::SeqCst) & CLOSED != 0
    }

    /// Number of registered tasks that have not yet finished
    pub fn in_flight(&self) -> usize {
        self.inner.state.load(Ordering::SeqCst) & !CLOSED
    }

    /// Register `future` and run it on the runtime.
    pub fn spawn<F>(&self, future: F) -> Result<JoinHandle<F::Output>, TrackerClosed>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        Ok(self.begin()?.spawn(future))
    }

    /// Wait until every registered task has released its guard.
    pub async fn wait_all(&self) {
        loop {
            let idle = self.inner.idle.notified();
            tokio::pin!(idle);
            // Register interest before reading the counter so a release that
            // lands in between still wakes us.
            idle.as_mut().enable();

            if self.in_flight() == 0 {
                return;
            }

            idle.await;
        }
    }
}

/// Tracker registration held by a running task.
#[must_use = "dropping the guard immediately releases the task registration"]
#[derive(Debug)]
pub struct TaskGuard {
    inner: Arc<TrackerInner>,
}

impl TaskGuard {
    /// Run `future` on the runtime, holding this registration until it ends.
    ///
    /// The guard is taken before `tokio::spawn`, so the tracker can never
    /// observe zero while the task is pending.
    pub fn spawn<F>(self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        tokio::spawn(async move {
            let _guard = self;
            future.await
        })
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        let previous = self.inner.state.fetch_sub(1, Ordering::SeqCst) & !CLOSED;
        debug_assert!(previous > 0, "task tracker released more than registered");
        TaskMetrics::record_end();

        if previous == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_all_returns_immediately_when_idle() {
        let tracker = TaskTracker::new();

        tokio::time::timeout(Duration::from_millis(100), tracker.wait_all())
            .await
            .expect("idle tracker should not block");
    }

    #[tokio::test]
    async fn test_begin_counts_before_task_runs() {
        let tracker = TaskTracker::new();

        let guard = tracker.begin().unwrap();
        assert_eq!(tracker.in_flight(), 1);

        drop(guard);
        assert_eq!(tracker.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_wait_all_waits_for_every_task() {
        let tracker = TaskTracker::new();
        let finished = Arc::new(AtomicUsize::new(0));

        for i in 0..20u64 {
            let finished = finished.clone();
            tracker
                .spawn(async move {
                    tokio::time::sleep(Duration::from_millis(i * 2)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        tracker.wait_all().await;

        assert_eq!(finished.load(Ordering::SeqCst), 20);
        assert_eq!(tracker.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_panicking_task_still_releases() {
        let tracker = TaskTracker::new();

        let handle = tracker
            .spawn(async {
                panic!("boom");
            })
            .unwrap();

        assert!(handle.await.unwrap_err().is_panic());

        tokio::time::timeout(Duration::from_secs(1), tracker.wait_all())
            .await
            .expect("panicked task must not leave the counter elevated");
        assert_eq!(tracker.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_wait_all_blocks_while_guard_held() {
        let tracker = TaskTracker::new();
        let guard = tracker.begin().unwrap();

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_all().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake once the guard is dropped")
            .unwrap();
    }

    #[tokio::test]
    async fn test_closed_tracker_refuses_new_work() {
        let tracker = TaskTracker::new();
        let held = tracker.begin().unwrap();

        assert!(tracker.close());
        assert!(!tracker.close());
        assert!(tracker.is_closed());

        assert_eq!(tracker.begin().unwrap_err(), TrackerClosed);
        assert!(tracker.spawn(async {}).is_err());
        // Registrations made before the close are still counted and awaited
        assert_eq!(tracker.in_flight(), 1);

        drop(held);
        assert_eq!(tracker.in_flight(), 0);
        tokio::time::timeout(Duration::from_millis(100), tracker.wait_all())
            .await
            .expect("closed idle tracker should not block");
    }

    #[test]
    fn test_begin_and_close_race_is_all_or_nothing() {
        let tracker = TaskTracker::new();
        let accepted = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let tracker = tracker.clone();
                let accepted = accepted.clone();
                std::thread::spawn(move || {
                    let mut guards = Vec::new();
                    for _ in 0..1_000 {
                        if let Ok(guard) = tracker.begin() {
                            accepted.fetch_add(1, Ordering::SeqCst);
                            guards.push(guard);
                        }
                    }
                    guards
                })
            })
            .collect();

        tracker.close();
        let held: Vec<_> = workers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .collect();

        assert_eq!(tracker.in_flight(), accepted.load(Ordering::SeqCst));
        assert_eq!(held.len(), tracker.in_flight());
        drop(held);
        assert_eq!(tracker.in_flight(), 0);
        assert!(tracker.is_closed());
    }
}
