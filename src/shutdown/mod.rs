//! Graceful shutdown for the background core.
//!
//! The coordinator walks a fixed state machine:
//!
//! ```text
//! Running -> ShutdownRequested -> Draining -> Closing -> Terminated
//! ```
//!
//! 1. `Running`: waits for a termination signal or [`ShutdownHandle::request_shutdown`]
//! 2. `Draining`: closes the task tracker, then waits for every tracked
//!    background task to finish. Registrations taken before the close are
//!    waited for; later ones fail. Nothing is released while this wait is
//!    outstanding, because a running task may still report an error or
//!    queue mail
//! 3. `Closing`: tells the mail dispatcher and then the error sink to stop,
//!    waits for both loops, then closes the mail queue, the error conduit and
//!    the done channels, in that order
//! 4. `Terminated`: returns a [`ShutdownReport`]
//!
//! Requesting shutdown more than once has no further effect. Mail still
//! queued when the dispatcher stops is discarded and counted in the report.

mod services;

pub use services::{start_background, BackgroundServices};

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::signal;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::error_sink::{ErrorReporter, ErrorSinkSummary};
use crate::mail::{DispatchSummary, Mailer};
use crate::metrics::ShutdownMetrics;
use crate::tasks::TaskTracker;

/// Lifecycle of the background core
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownState {
    Running,
    ShutdownRequested,
    Draining,
    Closing,
    Terminated,
}

impl ShutdownState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownState::Running => "running",
            ShutdownState::ShutdownRequested => "shutdown_requested",
            ShutdownState::Draining => "draining",
            ShutdownState::Closing => "closing",
            ShutdownState::Terminated => "terminated",
        }
    }
}

/// Cloneable handle to request and observe shutdown
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    state: Arc<watch::Sender<ShutdownState>>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ShutdownState::Running);
        Self {
            state: Arc::new(state),
        }
    }

    /// Ask the coordinator to shut down.
    ///
    /// Returns `true` only for the call that moved the state out of
    /// `Running`; every later call is ignored.
    pub fn request_shutdown(&self, reason: &str) -> bool {
        let accepted = self.state.send_if_modified(|state| {
            if *state == ShutdownState::Running {
                *state = ShutdownState::ShutdownRequested;
                true
            } else {
                false
            }
        });

        if accepted {
            tracing::info!(reason = %reason, "Shutdown requested");
        } else {
            tracing::debug!(
                reason = %reason,
                state = self.state().as_str(),
                "Shutdown already in progress, ignoring request"
            );
        }
        accepted
    }

    pub fn state(&self) -> ShutdownState {
        *self.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ShutdownState::Running
    }

    pub fn subscribe(&self) -> watch::Receiver<ShutdownState> {
        self.state.subscribe()
    }

    /// Resolves once shutdown has been requested
    pub async fn requested(&self) {
        let mut rx = self.subscribe();
        // The sender lives in `self`, so this cannot fail while we wait
        let _ = rx.wait_for(|state| *state != ShutdownState::Running).await;
    }

    /// Resolves once the coordinator has finished
    pub async fn terminated(&self) {
        let mut rx = self.subscribe();
        let _ = rx
            .wait_for(|state| *state == ShutdownState::Terminated)
            .await;
    }

    /// Move forward to `next`. Returns `false` if the state was already
    /// there or past it.
    fn advance(&self, next: ShutdownState) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if next > *state {
                *state = next;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::debug!(state = next.as_str(), "Shutdown state changed");
        }
        changed
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for graceful shutdown behavior
#[derive(Debug, Clone, Default)]
pub struct ShutdownConfig {
    /// Upper bound on the drain wait. `None` waits for as long as it takes.
    pub drain_timeout: Option<Duration>,
}

/// Result of a graceful shutdown
#[derive(Debug, Clone, Default, Serialize)]
pub struct ShutdownReport {
    /// Time from the shutdown request to termination
    pub duration: Duration,
    /// Time spent waiting for background tasks
    pub drain_duration: Duration,
    /// Whether the drain timeout expired with tasks still running
    pub drain_timed_out: bool,
    /// Tasks still registered when closing started
    pub tasks_abandoned: usize,
    pub mail_delivered: u64,
    pub mail_failed: u64,
    /// Queued messages discarded when the dispatcher stopped
    pub mail_dropped: u64,
    pub errors_logged: u64,
}

/// Owns the long-running loops and the order in which they are stopped.
pub struct ShutdownCoordinator {
    handle: ShutdownHandle,
    tracker: TaskTracker,
    config: ShutdownConfig,
    mailer: Mailer,
    reporter: ErrorReporter,
    dispatcher_done: oneshot::Sender<()>,
    dispatcher: JoinHandle<DispatchSummary>,
    sink_done: oneshot::Sender<()>,
    sink: JoinHandle<ErrorSinkSummary>,
}

/// The running loops handed to a [`ShutdownCoordinator`]
pub struct ManagedLoops {
    pub mailer: Mailer,
    pub reporter: ErrorReporter,
    pub dispatcher_done: oneshot::Sender<()>,
    pub dispatcher: JoinHandle<DispatchSummary>,
    pub sink_done: oneshot::Sender<()>,
    pub sink: JoinHandle<ErrorSinkSummary>,
}

impl ShutdownCoordinator {
    pub fn new(
        handle: ShutdownHandle,
        tracker: TaskTracker,
        loops: ManagedLoops,
        config: ShutdownConfig,
    ) -> Self {
        Self {
            handle,
            tracker,
            config,
            mailer: loops.mailer,
            reporter: loops.reporter,
            dispatcher_done: loops.dispatcher_done,
            dispatcher: loops.dispatcher,
            sink_done: loops.sink_done,
            sink: loops.sink,
        }
    }

    pub fn handle(&self) -> ShutdownHandle {
        self.handle.clone()
    }

    /// Wait for a shutdown request, then run the shutdown sequence
    pub async fn run(self) -> ShutdownReport {
        self.handle.requested().await;
        self.execute().await
    }

    #[tracing::instrument(
        name = "graceful_shutdown",
        skip(self),
        fields(in_flight = self.tracker.in_flight())
    )]
    async fn execute(self) -> ShutdownReport {
        let start = std::time::Instant::now();
        let mut report = ShutdownReport::default();

        // Phase 1: drain background tasks
        tracing::info!("Gracefully shutting down - Phase 1: Waiting for background tasks");
        self.handle.advance(ShutdownState::Draining);
        // From here on a request that has not yet registered its tasks is
        // refused; one that has is waited for below.
        self.tracker.close();
        let drain_start = std::time::Instant::now();

        match self.config.drain_timeout {
            Some(limit) => {
                if timeout(limit, self.tracker.wait_all()).await.is_err() {
                    report.drain_timed_out = true;
                    report.tasks_abandoned = self.tracker.in_flight();
                    tracing::error!(
                        timeout_secs = limit.as_secs_f64(),
                        tasks_abandoned = report.tasks_abandoned,
                        "Drain timeout expired with background tasks still running; \
                         their errors and mail may be lost"
                    );
                }
            }
            None => self.tracker.wait_all().await,
        }

        report.drain_duration = drain_start.elapsed();
        ShutdownMetrics::record_drain(report.drain_duration.as_secs_f64());

        // Phase 2: stop the consumers. The dispatcher goes first so that any
        // failure from its final delivery still reaches a running error sink.
        tracing::info!("Phase 2: Stopping mail dispatcher and error sink");
        self.handle.advance(ShutdownState::Closing);

        let _ = self.dispatcher_done.send(());
        match self.dispatcher.await {
            Ok(summary) => {
                report.mail_delivered = summary.delivered;
                report.mail_failed = summary.failed;
                report.mail_dropped = summary.dropped;
            }
            Err(e) => tracing::error!(error = %e, "Mail dispatcher task failed"),
        }

        let _ = self.sink_done.send(());
        match self.sink.await {
            Ok(summary) => report.errors_logged = summary.logged,
            Err(e) => tracing::error!(error = %e, "Error sink task failed"),
        }

        // Phase 3: close producer-facing queues, then the signal channels.
        // The loops dropped their receivers on return; these are the last
        // coordinator-held senders.
        tracing::info!("Phase 3: Closing channels");
        drop(self.mailer);
        drop(self.reporter);

        report.duration = start.elapsed();
        self.handle.advance(ShutdownState::Terminated);

        tracing::info!(
            duration_ms = report.duration.as_millis() as u64,
            drain_ms = report.drain_duration.as_millis() as u64,
            drain_timed_out = report.drain_timed_out,
            mail_delivered = report.mail_delivered,
            mail_failed = report.mail_failed,
            mail_dropped = report.mail_dropped,
            errors_logged = report.errors_logged,
            "Graceful shutdown completed"
        );

        report
    }
}

/// Resolve on Ctrl+C or, on unix, SIGTERM. Returns the signal name.
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                Ok("SIGINT")
            }
            _ = terminate.recv() => Ok("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        Ok("ctrl_c")
    }
}

/// Forward process termination signals to `handle` until shutdown finishes.
///
/// Signals received after the first one are ignored by the handle.
pub async fn listen_for_signals(handle: ShutdownHandle) {
    loop {
        tokio::select! {
            _ = handle.terminated() => return,
            received = wait_for_signal() => match received {
                Ok(name) => {
                    handle.request_shutdown(name);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to install signal handler");
                    return;
                }
            },
        }
    }
}
