//! Fire-and-forget background work.
//!
//! Every task is registered with the [`TaskTracker`] before it starts and
//! releases its registration on every exit path. Failures are never returned
//! to whoever spawned the task; they go to the error sink instead.

mod tracker;

pub use tracker::{TaskGuard, TaskTracker, TrackerClosed};

use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::error::TaskError;
use crate::error_sink::ErrorReporter;
use crate::metrics::TaskMetrics;

/// Spawns tracked tasks whose failures are forwarded to the error sink.
#[derive(Clone)]
pub struct TaskSpawner {
    tracker: TaskTracker,
    reporter: ErrorReporter,
}

impl TaskSpawner {
    pub fn new(tracker: TaskTracker, reporter: ErrorReporter) -> Self {
        Self { tracker, reporter }
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    pub fn reporter(&self) -> &ErrorReporter {
        &self.reporter
    }

    /// Register one task now and spawn it later with [`TaskSpawner::spawn_reserved`].
    ///
    /// Taking the registration before slow request-side work keeps shutdown
    /// from draining past a request that is about to start background work.
    pub fn reserve(&self) -> Result<TaskGuard, TrackerClosed> {
        self.tracker.begin()
    }

    /// Run `task` in the background.
    ///
    /// An `Err` result is reported under `name`. A panic is caught and
    /// reported as [`TaskError::Panicked`]. The tracker registration is
    /// released in both cases. Fails once the tracker has been closed.
    pub fn spawn<F>(&self, name: &'static str, task: F) -> Result<JoinHandle<()>, TrackerClosed>
    where
        F: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        let guard = self.tracker.begin()?;
        Ok(self.spawn_reserved(guard, name, task))
    }

    /// Run `task` under a registration taken earlier with [`TaskSpawner::reserve`]
    pub fn spawn_reserved<F>(&self, guard: TaskGuard, name: &'static str, task: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        TaskMetrics::record_spawned(name);
        let reporter = self.reporter.clone();
        let span = tracing::info_span!("background_task", task = name);

        guard.spawn(
            async move {
                match AssertUnwindSafe(task).catch_unwind().await {
                    Ok(Ok(())) => {
                        tracing::debug!("Background task completed");
                    }
                    Ok(Err(err)) => {
                        reporter.report(name, err);
                    }
                    Err(_) => {
                        TaskMetrics::record_panic();
                        reporter.report(
                            name,
                            TaskError::Panicked {
                                task: name.to_string(),
                            },
                        );
                    }
                }
            }
            .instrument(span),
        )
    }
}
