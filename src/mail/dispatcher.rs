use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use lettre::message::Mailbox;
use lettre::Address;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::MailConfig;
use crate::error::TaskError;
use crate::error_sink::ErrorReporter;
use crate::metrics::MailMetrics;
use crate::tasks::{TaskGuard, TaskSpawner, TrackerClosed};
use crate::template::{TemplateStore, DEFAULT_TEMPLATE};

use super::transport::{LoadedAttachment, MailTransport, OutgoingMail};
use super::{MailError, Message};

/// Counters shared by the mailer handles and the dispatcher loop
#[derive(Debug, Default)]
struct MailerStats {
    queued: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Snapshot of mailer statistics
#[derive(Debug, Clone, Serialize)]
pub struct MailerStatsSnapshot {
    pub queued_total: u64,
    pub delivered_total: u64,
    pub failed_total: u64,
    pub dropped_total: u64,
    /// Messages currently waiting in the queue
    pub pending: usize,
    pub capacity: usize,
}

/// Producer handle for the mail queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Mailer {
    tx: mpsc::Sender<Message>,
    stats: Arc<MailerStats>,
}

impl Mailer {
    /// Queue `message` for delivery.
    ///
    /// Waits while the queue is full. That wait is the backpressure point for
    /// producers; callers that must not wait should use [`Mailer::send_tracked`].
    pub async fn send(&self, message: Message) -> Result<(), MailError> {
        self.tx
            .send(message)
            .await
            .map_err(|_| MailError::Closed)?;
        self.record_queued();
        Ok(())
    }

    /// Queue `message` only if there is room right now
    pub fn try_send(&self, message: Message) -> Result<(), MailError> {
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => MailError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => MailError::Closed,
        })?;
        self.record_queued();
        Ok(())
    }

    /// Queue `message` from a tracked background task so the caller never
    /// waits on backpressure. Failures go to the error sink.
    ///
    /// Fails only when the spawner no longer accepts work.
    pub fn send_tracked(
        &self,
        spawner: &TaskSpawner,
        message: Message,
    ) -> Result<JoinHandle<()>, TrackerClosed> {
        let slot = spawner.reserve()?;
        Ok(self.send_reserved(spawner, slot, message))
    }

    /// Like [`Mailer::send_tracked`], under a registration the caller took
    /// with [`TaskSpawner::reserve`].
    pub fn send_reserved(
        &self,
        spawner: &TaskSpawner,
        slot: TaskGuard,
        message: Message,
    ) -> JoinHandle<()> {
        let mailer = self.clone();
        spawner.spawn_reserved(slot, "send_email", async move {
            mailer.send(message).await?;
            Ok(())
        })
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Messages currently waiting in the queue
    pub fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn stats(&self) -> MailerStatsSnapshot {
        MailerStatsSnapshot {
            queued_total: self.stats.queued.load(Ordering::Relaxed),
            delivered_total: self.stats.delivered.load(Ordering::Relaxed),
            failed_total: self.stats.failed.load(Ordering::Relaxed),
            dropped_total: self.stats.dropped.load(Ordering::Relaxed),
            pending: self.pending(),
            capacity: self.capacity(),
        }
    }

    fn record_queued(&self) {
        self.stats.queued.fetch_add(1, Ordering::Relaxed);
        MailMetrics::record_queued();
    }
}

/// What the dispatcher loop did before it returned
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub delivered: u64,
    pub failed: u64,
    /// Messages still queued when the loop stopped, discarded undelivered
    pub dropped: u64,
}

/// The single consumer of the mail queue
pub struct MailDispatcher {
    rx: mpsc::Receiver<Message>,
    transport: Arc<dyn MailTransport>,
    templates: Arc<TemplateStore>,
    reporter: ErrorReporter,
    sender: Mailbox,
    capacity: usize,
    stats: Arc<MailerStats>,
}

impl MailDispatcher {
    /// Create the dispatcher and the [`Mailer`] that feeds it.
    pub fn new(
        config: &MailConfig,
        transport: Arc<dyn MailTransport>,
        templates: Arc<TemplateStore>,
        reporter: ErrorReporter,
    ) -> Result<(Self, Mailer), MailError> {
        if config.queue_capacity == 0 {
            return Err(MailError::Build(
                "queue capacity must be greater than zero".to_string(),
            ));
        }

        let address = config
            .from_address
            .parse::<Address>()
            .map_err(|e| MailError::InvalidAddress(format!("{}: {}", config.from_address, e)))?;
        let sender = Mailbox::new(Some(config.from_name.clone()), address);

        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let stats = Arc::new(MailerStats::default());

        let dispatcher = Self {
            rx,
            transport,
            templates,
            reporter,
            sender,
            capacity: config.queue_capacity,
            stats: stats.clone(),
        };

        Ok((dispatcher, Mailer { tx, stats }))
    }

    /// Deliver queued messages one at a time until `done` fires.
    ///
    /// The done signal wins over pending messages: once it fires the loop
    /// stops and whatever is still queued is discarded.
    pub async fn run(mut self, mut done: oneshot::Receiver<()>) -> DispatchSummary {
        let mut summary = DispatchSummary::default();

        tracing::info!(
            transport = self.transport.name(),
            capacity = self.capacity,
            "Mail dispatcher started"
        );

        loop {
            tokio::select! {
                biased;
                _ = &mut done => {
                    tracing::debug!("Mail dispatcher received done signal");
                    break;
                }
                next = self.rx.recv() => match next {
                    Some(message) => self.process(message, &mut summary).await,
                    None => {
                        tracing::debug!("All mailers dropped");
                        break;
                    }
                },
            }
        }

        summary.dropped = self.discard_backlog();

        tracing::info!(
            delivered = summary.delivered,
            failed = summary.failed,
            dropped = summary.dropped,
            "Mail dispatcher stopped"
        );
        summary
    }

    async fn process(&self, message: Message, summary: &mut DispatchSummary) {
        let started = Instant::now();
        let message_id = message.id();

        match self.deliver(message).await {
            Ok(()) => {
                summary.delivered += 1;
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                MailMetrics::record_delivered(started.elapsed().as_secs_f64());
                tracing::debug!(message_id = %message_id, "Message delivered");
            }
            Err(err) => {
                summary.failed += 1;
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                MailMetrics::record_failed();
                self.reporter.report("mail_dispatcher", err);
            }
        }
    }

    /// Render the message and hand it to the transport
    #[tracing::instrument(
        name = "mail.deliver",
        skip(self, message),
        fields(message_id = %message.id(), to = %message.to())
    )]
    async fn deliver(&self, message: Message) -> Result<(), TaskError> {
        let template = message.template().unwrap_or(DEFAULT_TEMPLATE);
        let body = self.templates.render(template, message.data())?;

        let mut attachments = Vec::with_capacity(message.attachments().len());
        for (name, path) in message.attachments() {
            let content = tokio::fs::read(path)
                .await
                .map_err(|source| MailError::Attachment {
                    name: name.clone(),
                    source,
                })?;
            attachments.push(LoadedAttachment {
                filename: name.clone(),
                content_type: mime_guess::from_path(path)
                    .first_or_octet_stream()
                    .to_string(),
                content,
            });
        }

        let from = match message.from() {
            Some((name, address)) => Mailbox::new(Some(name.to_string()), address.clone()),
            None => self.sender.clone(),
        };

        let mail = OutgoingMail {
            id: message.id(),
            from,
            to: Mailbox::new(None, message.to().clone()),
            subject: message.subject().to_string(),
            body,
            attachments,
        };

        self.transport.deliver(&mail).await?;
        Ok(())
    }

    /// Close the queue and count what is left in it
    fn discard_backlog(&mut self) -> u64 {
        self.rx.close();

        let mut dropped = 0u64;
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }

        if dropped > 0 {
            self.stats.dropped.fetch_add(dropped, Ordering::Relaxed);
            MailMetrics::record_dropped(dropped);
            tracing::warn!(
                dropped,
                "Discarded queued messages at shutdown; they were not delivered"
            );
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_sink;
    use crate::mail::MemoryTransport;
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        mailer: Mailer,
        transport: Arc<MemoryTransport>,
        done: oneshot::Sender<()>,
        handle: JoinHandle<DispatchSummary>,
        errors: Arc<crate::error_sink::ErrorSinkStats>,
        _sink: error_sink::ErrorSink,
    }

    fn start(transport: MemoryTransport) -> Harness {
        let transport = Arc::new(transport);
        let (reporter, sink) = error_sink::channel();
        let errors = reporter.stats();
        let (dispatcher, mailer) = MailDispatcher::new(
            &MailConfig::default(),
            transport.clone(),
            Arc::new(TemplateStore::new()),
            reporter,
        )
        .unwrap();
        let (done, done_rx) = oneshot::channel();
        let handle = tokio::spawn(dispatcher.run(done_rx));

        Harness {
            mailer,
            transport,
            done,
            handle,
            errors,
            _sink: sink,
        }
    }

    async fn wait_for_attempts(transport: &MemoryTransport, count: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while transport.attempts() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("dispatcher should attempt delivery");
    }

    #[tokio::test]
    async fn test_delivers_with_default_template() {
        let h = start(MemoryTransport::new());

        let message = Message::builder("user@example.com", "Failed login attempt")
            .data("Invalid login!")
            .build()
            .unwrap();
        h.mailer.send(message).await.unwrap();
        wait_for_attempts(&h.transport, 1).await;

        h.done.send(()).unwrap();
        let summary = h.handle.await.unwrap();

        assert_eq!(summary.delivered, 1);
        let sent = h.transport.sent();
        assert_eq!(sent[0].subject, "Failed login attempt");
        assert!(sent[0].body.plain.contains("Invalid login!"));
        assert_eq!(sent[0].from.email.to_string(), "info@localhost.com");
    }

    #[tokio::test]
    async fn test_delivery_failure_is_reported_not_returned() {
        let transport = MemoryTransport::new();
        transport.fail_for("bounce@example.com");
        let h = start(transport);

        let message = Message::builder("bounce@example.com", "Hi").build().unwrap();
        assert!(h.mailer.send(message).await.is_ok());
        wait_for_attempts(&h.transport, 1).await;

        h.done.send(()).unwrap();
        let summary = h.handle.await.unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(h.errors.reported(), 1);
        assert_eq!(h.mailer.stats().failed_total, 1);
    }

    #[tokio::test]
    async fn test_attachment_is_read_at_delivery() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1_manual.txt");
        std::fs::write(&path, "User guide").unwrap();

        let h = start(MemoryTransport::new());
        let message = Message::builder("user@example.com", "Your Manual")
            .data("Please see attached")
            .attach("manual.txt", &path)
            .build()
            .unwrap();
        h.mailer.send(message).await.unwrap();
        wait_for_attempts(&h.transport, 1).await;

        h.done.send(()).unwrap();
        h.handle.await.unwrap();

        let sent = h.transport.sent();
        assert_eq!(sent[0].attachments.len(), 1);
        assert_eq!(sent[0].attachments[0].filename, "manual.txt");
        assert_eq!(sent[0].attachments[0].content_type, "text/plain");
        assert_eq!(sent[0].attachments[0].content, b"User guide");
    }

    #[tokio::test]
    async fn test_missing_attachment_and_template_are_reported() {
        let h = start(MemoryTransport::new());

        let missing_file = Message::builder("user@example.com", "Manual")
            .attach("manual.txt", "/definitely/not/here.txt")
            .build()
            .unwrap();
        let missing_template = Message::builder("user@example.com", "Invoice")
            .template("no-such-template")
            .data(json!({ "amount": "$1.00" }))
            .build()
            .unwrap();
        h.mailer.send(missing_file).await.unwrap();
        h.mailer.send(missing_template).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while h.errors.reported() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        h.done.send(()).unwrap();
        let summary = h.handle.await.unwrap();
        assert_eq!(summary.failed, 2);
        assert_eq!(h.transport.attempts(), 0);
    }

    #[tokio::test]
    async fn test_try_send_reports_full_queue() {
        let (reporter, _sink) = error_sink::channel();
        let config = MailConfig {
            queue_capacity: 1,
            ..MailConfig::default()
        };
        let (_dispatcher, mailer) = MailDispatcher::new(
            &config,
            Arc::new(MemoryTransport::new()),
            Arc::new(TemplateStore::new()),
            reporter,
        )
        .unwrap();

        let msg = || Message::builder("user@example.com", "Hi").build().unwrap();
        mailer.try_send(msg()).unwrap();
        assert!(matches!(mailer.try_send(msg()), Err(MailError::QueueFull)));
        assert_eq!(mailer.pending(), 1);
    }

    #[tokio::test]
    async fn test_send_after_dispatcher_stops_is_closed() {
        let h = start(MemoryTransport::new());
        h.done.send(()).unwrap();
        h.handle.await.unwrap();

        let message = Message::builder("user@example.com", "Hi").build().unwrap();
        assert!(matches!(
            h.mailer.send(message).await,
            Err(MailError::Closed)
        ));
    }
}
