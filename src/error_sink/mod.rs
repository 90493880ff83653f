//! Single destination for background failures.
//!
//! Any number of [`ErrorReporter`] clones feed one unbounded conduit. A single
//! [`ErrorSink`] loop owns the receiving end and logs every error until its
//! done signal fires. Reporting never blocks the producer.
//!
//! The conduit is closed when the loop returns and drops its receiver. The
//! shutdown coordinator only stops the loop after every tracked task has
//! finished, so no registered producer can outlive the receiver. A report
//! that still arrives after that point is logged directly instead of being
//! lost.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::error::TaskError;
use crate::metrics::ErrorMetrics;

/// Number of logged errors kept for the stats endpoint
const RECENT_ERRORS_CAPACITY: usize = 50;

/// An error travelling through the sink
#[derive(Debug)]
pub struct ReportedError {
    pub task: String,
    pub error: TaskError,
    pub reported_at: DateTime<Utc>,
}

/// Logged error as exposed to observers
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub task: String,
    pub message: String,
    pub reported_at: DateTime<Utc>,
}

/// Counters shared between the reporters and the consumer loop
#[derive(Debug, Default)]
pub struct ErrorSinkStats {
    reported: AtomicU64,
    logged: AtomicU64,
    recent: Mutex<VecDeque<ErrorRecord>>,
}

impl ErrorSinkStats {
    pub fn reported(&self) -> u64 {
        self.reported.load(Ordering::SeqCst)
    }

    pub fn logged(&self) -> u64 {
        self.logged.load(Ordering::SeqCst)
    }

    /// Most recent logged errors, oldest first
    pub fn recent(&self) -> Vec<ErrorRecord> {
        match self.recent.lock() {
            Ok(recent) => recent.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    fn remember(&self, record: ErrorRecord) {
        let mut recent = match self.recent.lock() {
            Ok(recent) => recent,
            Err(poisoned) => poisoned.into_inner(),
        };
        if recent.len() == RECENT_ERRORS_CAPACITY {
            recent.pop_front();
        }
        recent.push_back(record);
    }
}

/// Producer handle for the error sink. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ErrorReporter {
    tx: mpsc::UnboundedSender<ReportedError>,
    stats: Arc<ErrorSinkStats>,
}

impl ErrorReporter {
    /// Submit an error without blocking. Never fails from the caller's view.
    pub fn report(&self, task: &str, error: impl Into<TaskError>) {
        let reported = ReportedError {
            task: task.to_string(),
            error: error.into(),
            reported_at: Utc::now(),
        };

        self.stats.reported.fetch_add(1, Ordering::SeqCst);
        ErrorMetrics::record_reported();

        if let Err(mpsc::error::SendError(reported)) = self.tx.send(reported) {
            tracing::error!(
                task = %reported.task,
                error = %reported.error,
                "Error reported after the error sink closed"
            );
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn stats(&self) -> Arc<ErrorSinkStats> {
        self.stats.clone()
    }
}

/// What the consumer loop did before it returned
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorSinkSummary {
    pub logged: u64,
}

/// Consumer side of the error sink
#[derive(Debug)]
pub struct ErrorSink {
    rx: mpsc::UnboundedReceiver<ReportedError>,
    stats: Arc<ErrorSinkStats>,
}

/// Create a connected reporter / sink pair.
pub fn channel() -> (ErrorReporter, ErrorSink) {
    let (tx, rx) = mpsc::unbounded_channel();
    let stats = Arc::new(ErrorSinkStats::default());

    (
        ErrorReporter {
            tx,
            stats: stats.clone(),
        },
        ErrorSink { rx, stats },
    )
}

impl ErrorSink {
    pub fn stats(&self) -> Arc<ErrorSinkStats> {
        self.stats.clone()
    }

    /// Log errors until `done` fires.
    ///
    /// Errors already buffered when `done` fires are still logged. The
    /// receiver is dropped on return, which closes the conduit.
    pub async fn run(mut self, mut done: oneshot::Receiver<()>) -> ErrorSinkSummary {
        let mut summary = ErrorSinkSummary::default();
        tracing::info!("Error sink started");

        loop {
            tokio::select! {
                biased;
                _ = &mut done => {
                    tracing::debug!("Error sink received done signal");
                    break;
                }
                next = self.rx.recv() => match next {
                    Some(reported) => self.log(reported, &mut summary),
                    None => {
                        tracing::debug!("All error reporters dropped");
                        break;
                    }
                },
            }
        }

        while let Ok(reported) = self.rx.try_recv() {
            self.log(reported, &mut summary);
        }

        tracing::info!(logged = summary.logged, "Error sink stopped");
        summary
    }

    fn log(&self, reported: ReportedError, summary: &mut ErrorSinkSummary) {
        tracing::error!(
            task = %reported.task,
            error = %reported.error,
            reported_at = %reported.reported_at,
            "Background task failed"
        );

        summary.logged += 1;
        self.stats.logged.fetch_add(1, Ordering::SeqCst);
        ErrorMetrics::record_logged();

        self.stats.remember(ErrorRecord {
            task: reported.task,
            message: reported.error.to_string(),
            reported_at: reported.reported_at,
        });
    }
}
