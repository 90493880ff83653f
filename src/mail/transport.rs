//! Delivery backends for the mail dispatcher

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::extension::ClientId;
use lettre::{AsyncFileTransport, AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use uuid::Uuid;

use crate::config::{MailConfig, MailEncryption, TransportKind};
use crate::template::RenderedMail;

use super::MailError;

/// File contents read for one attachment
#[derive(Debug, Clone)]
pub struct LoadedAttachment {
    pub filename: String,
    pub content_type: String,
    pub content: Vec<u8>,
}

/// A fully rendered message, ready for a transport
#[derive(Debug, Clone)]
pub struct OutgoingMail {
    pub id: Uuid,
    pub from: Mailbox,
    pub to: Mailbox,
    pub subject: String,
    pub body: RenderedMail,
    pub attachments: Vec<LoadedAttachment>,
}

impl OutgoingMail {
    /// Build the MIME message: a plain/HTML alternative plus any attachments.
    pub fn to_lettre(&self, domain: &str) -> Result<lettre::Message, MailError> {
        let alternative =
            MultiPart::alternative_plain_html(self.body.plain.clone(), self.body.html.clone());
        let mut mixed = MultiPart::mixed().multipart(alternative);

        for attachment in &self.attachments {
            let content_type = ContentType::parse(&attachment.content_type)
                .map_err(|e| MailError::Build(format!("{}: {}", attachment.filename, e)))?;
            mixed = mixed.singlepart(
                Attachment::new(attachment.filename.clone())
                    .body(attachment.content.clone(), content_type),
            );
        }

        lettre::Message::builder()
            .message_id(Some(format!("<{}@{}>", self.id, domain)))
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(self.subject.clone())
            .multipart(mixed)
            .map_err(|e| MailError::Build(e.to_string()))
    }
}

/// Backend that performs the actual delivery of one message.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    async fn deliver(&self, mail: &OutgoingMail) -> Result<(), MailError>;
}

/// Create the transport selected in configuration.
pub async fn create_transport(config: &MailConfig) -> Result<Arc<dyn MailTransport>, MailError> {
    let transport: Arc<dyn MailTransport> = match config.transport {
        TransportKind::Smtp => Arc::new(SmtpTransport::from_config(config)?),
        TransportKind::Outbox => {
            Arc::new(OutboxTransport::new(&config.outbox_dir, config.domain.clone()).await?)
        }
        TransportKind::Memory => Arc::new(MemoryTransport::new()),
    };

    tracing::info!(
        transport = transport.name(),
        host = %config.host,
        port = config.port,
        "Mail transport created"
    );
    Ok(transport)
}

/// SMTP relay delivery
pub struct SmtpTransport {
    inner: AsyncSmtpTransport<Tokio1Executor>,
    domain: String,
}

impl SmtpTransport {
    pub fn from_config(config: &MailConfig) -> Result<Self, MailError> {
        let builder = match config.encryption {
            MailEncryption::None => {
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(config.host.as_str())
            }
            MailEncryption::StartTls => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                    .map_err(|e| MailError::Transport(e.to_string()))?
            }
            MailEncryption::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
                .map_err(|e| MailError::Transport(e.to_string()))?,
        };

        let mut builder = builder
            .port(config.port)
            .hello_name(ClientId::Domain(config.domain.clone()))
            .timeout(Some(Duration::from_secs(config.timeout_secs)));

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(Self {
            inner: builder.build(),
            domain: config.domain.clone(),
        })
    }
}

#[async_trait]
impl MailTransport for SmtpTransport {
    fn name(&self) -> &'static str {
        "smtp"
    }

    async fn deliver(&self, mail: &OutgoingMail) -> Result<(), MailError> {
        let email = mail.to_lettre(&self.domain)?;
        self.inner
            .send(email)
            .await
            .map_err(|e| MailError::Transport(e.to_string()))?;
        Ok(())
    }
}

/// Writes each message as an `.eml` file into a local outbox directory
pub struct OutboxTransport {
    inner: AsyncFileTransport<Tokio1Executor>,
    domain: String,
}

impl OutboxTransport {
    pub async fn new(dir: &Path, domain: String) -> Result<Self, MailError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| MailError::Transport(format!("{}: {}", dir.display(), e)))?;

        Ok(Self {
            inner: AsyncFileTransport::<Tokio1Executor>::new(dir),
            domain,
        })
    }
}

#[async_trait]
impl MailTransport for OutboxTransport {
    fn name(&self) -> &'static str {
        "outbox"
    }

    async fn deliver(&self, mail: &OutgoingMail) -> Result<(), MailError> {
        let email = mail.to_lettre(&self.domain)?;
        let file_id = self
            .inner
            .send(email)
            .await
            .map_err(|e| MailError::Transport(e.to_string()))?;
        tracing::debug!(mail_id = %mail.id, file_id = %file_id, "Message written to outbox");
        Ok(())
    }
}

/// Keeps delivered messages in memory. Recipients can be marked as failing.
#[derive(Default)]
pub struct MemoryTransport {
    sent: Mutex<Vec<OutgoingMail>>,
    failing: Mutex<HashSet<String>>,
    attempts: AtomicUsize,
    delay: Option<Duration>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every delivery
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Make every delivery to `address` fail
    pub fn fail_for(&self, address: &str) {
        lock(&self.failing).insert(address.to_string());
    }

    /// Deliveries attempted, successful or not
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<OutgoingMail> {
        lock(&self.sent).clone()
    }

    pub fn sent_count(&self) -> usize {
        lock(&self.sent).len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[async_trait]
impl MailTransport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn deliver(&self, mail: &OutgoingMail) -> Result<(), MailError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let recipient = mail.to.email.to_string();
        if lock(&self.failing).contains(&recipient) {
            return Err(MailError::Transport(format!(
                "recipient {} rejected",
                recipient
            )));
        }

        lock(&self.sent).push(mail.clone());
        Ok(())
    }
}
