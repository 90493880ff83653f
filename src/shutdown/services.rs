//! Startup of the long-running loops the coordinator later stops.

use std::sync::Arc;

use tokio::sync::oneshot;

use crate::config::{MailConfig, ShutdownSettings};
use crate::error_sink::{self, ErrorReporter, ErrorSinkStats};
use crate::mail::{MailDispatcher, MailError, MailTransport, Mailer};
use crate::tasks::{TaskSpawner, TaskTracker};
use crate::template::TemplateStore;

use super::{ManagedLoops, ShutdownConfig, ShutdownCoordinator, ShutdownHandle};

/// Producer-side handles shared with the rest of the application
#[derive(Clone)]
pub struct BackgroundServices {
    pub tracker: TaskTracker,
    pub spawner: TaskSpawner,
    pub mailer: Mailer,
    pub reporter: ErrorReporter,
    pub errors: Arc<ErrorSinkStats>,
    pub shutdown: ShutdownHandle,
}

/// Start the error sink and the mail dispatcher.
///
/// Both loops are spawned untracked: they are stopped by the returned
/// coordinator, after every tracked task has finished.
pub fn start_background(
    mail: &MailConfig,
    shutdown: &ShutdownSettings,
    transport: Arc<dyn MailTransport>,
    templates: Arc<TemplateStore>,
) -> Result<(BackgroundServices, ShutdownCoordinator), MailError> {
    let tracker = TaskTracker::new();
    let handle = ShutdownHandle::new();

    let (reporter, sink) = error_sink::channel();
    let errors = sink.stats();
    let (dispatcher, mailer) = MailDispatcher::new(mail, transport, templates, reporter.clone())?;

    let (sink_done, sink_done_rx) = oneshot::channel();
    let sink = tokio::spawn(sink.run(sink_done_rx));

    let (dispatcher_done, dispatcher_done_rx) = oneshot::channel();
    let dispatcher = tokio::spawn(dispatcher.run(dispatcher_done_rx));

    let services = BackgroundServices {
        spawner: TaskSpawner::new(tracker.clone(), reporter.clone()),
        tracker: tracker.clone(),
        mailer: mailer.clone(),
        reporter: reporter.clone(),
        errors,
        shutdown: handle.clone(),
    };

    let coordinator = ShutdownCoordinator::new(
        handle,
        tracker,
        ManagedLoops {
            mailer,
            reporter,
            dispatcher_done,
            dispatcher,
            sink_done,
            sink,
        },
        ShutdownConfig {
            drain_timeout: shutdown.drain_timeout(),
        },
    );

    tracing::info!(
        queue_capacity = mail.queue_capacity,
        drain_timeout_secs = ?shutdown.drain_timeout_secs,
        "Background services started"
    );

    Ok((services, coordinator))
}
