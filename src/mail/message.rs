use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use lettre::Address;
use uuid::Uuid;

use super::MailError;

/// An outbound mail request.
///
/// Immutable once built. Ownership moves into the dispatcher queue on send.
#[derive(Debug, Clone)]
pub struct Message {
    id: Uuid,
    from: Option<(String, Address)>,
    to: Address,
    subject: String,
    template: Option<String>,
    data: serde_json::Value,
    attachments: BTreeMap<String, PathBuf>,
}

impl Message {
    pub fn builder(to: impl Into<String>, subject: impl Into<String>) -> MessageBuilder {
        MessageBuilder {
            from: None,
            to: to.into(),
            subject: subject.into(),
            template: None,
            data: serde_json::Value::Null,
            attachments: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Sender override as (display name, address)
    pub fn from(&self) -> Option<(&str, &Address)> {
        self.from.as_ref().map(|(name, addr)| (name.as_str(), addr))
    }

    pub fn to(&self) -> &Address {
        &self.to
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn template(&self) -> Option<&str> {
        self.template.as_deref()
    }

    pub fn data(&self) -> &serde_json::Value {
        &self.data
    }

    /// Attachment display name to file path
    pub fn attachments(&self) -> &BTreeMap<String, PathBuf> {
        &self.attachments
    }
}

#[derive(Debug, Clone)]
pub struct MessageBuilder {
    from: Option<(String, String)>,
    to: String,
    subject: String,
    template: Option<String>,
    data: serde_json::Value,
    attachments: BTreeMap<String, PathBuf>,
}

impl MessageBuilder {
    pub fn from(mut self, name: impl Into<String>, address: impl Into<String>) -> Self {
        self.from = Some((name.into(), address.into()));
        self
    }

    pub fn template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    /// Payload handed to the template: structured data or pre-rendered text
    pub fn data(mut self, data: impl Into<serde_json::Value>) -> Self {
        self.data = data.into();
        self
    }

    pub fn attach(mut self, display_name: impl Into<String>, path: impl AsRef<Path>) -> Self {
        self.attachments
            .insert(display_name.into(), path.as_ref().to_path_buf());
        self
    }

    pub fn build(self) -> Result<Message, MailError> {
        let to = parse_address(&self.to)?;
        let from = match self.from {
            Some((name, address)) => Some((name, parse_address(&address)?)),
            None => None,
        };

        Ok(Message {
            id: Uuid::new_v4(),
            from,
            to,
            subject: self.subject,
            template: self.template,
            data: self.data,
            attachments: self.attachments,
        })
    }
}

fn parse_address(raw: &str) -> Result<Address, MailError> {
    raw.trim()
        .parse::<Address>()
        .map_err(|e| MailError::InvalidAddress(format!("{}: {}", raw, e)))
}
