//! Outbound mail.
//!
//! Producers hand [`Message`] values to a [`Mailer`], which feeds a bounded
//! queue. One [`MailDispatcher`] loop renders and delivers them serially
//! through a [`MailTransport`]. Delivery failures are reported to the error
//! sink, never to the producer, which has usually returned by then.
//!
//! # Transports
//!
//! | Kind | Implementation | Use |
//! |------|----------------|-----|
//! | `smtp` | [`SmtpTransport`] | SMTP relay via lettre (plain, STARTTLS or TLS) |
//! | `outbox` | [`OutboxTransport`] | writes `.eml` files to a directory |
//! | `memory` | [`MemoryTransport`] | keeps messages in memory, for tests |
//!
//! # Shutdown
//!
//! When the dispatcher is told to stop it returns without draining its queue.
//! Messages still queued at that point are discarded and counted as dropped.
//! Operators should treat mail as best-effort across restarts.

mod dispatcher;
mod message;
mod transport;

pub use dispatcher::{DispatchSummary, MailDispatcher, Mailer, MailerStatsSnapshot};
pub use message::{Message, MessageBuilder};
pub use transport::{
    create_transport, LoadedAttachment, MailTransport, MemoryTransport, OutboxTransport,
    OutgoingMail, SmtpTransport,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MailError {
    #[error("mail queue is full")]
    QueueFull,

    #[error("mail queue is closed")]
    Closed,

    #[error("invalid email address: {0}")]
    InvalidAddress(String),

    #[error("failed to build message: {0}")]
    Build(String),

    #[error("failed to read attachment '{name}': {source}")]
    Attachment {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transport error: {0}")]
    Transport(String),
}
