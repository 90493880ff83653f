//! Mail templates.
//!
//! This module provides:
//! - Named mail templates with an HTML and a plain-text part
//! - A concurrent in-memory store, seeded with built-in templates and
//!   optionally loaded from a directory
//! - Variable substitution of `{{variable}}` placeholders
//!
//! # Example
//!
//! ```ignore
//! let store = TemplateStore::new();
//!
//! let rendered = store.render("invoice", &json!({
//!     "plan_name": "Gold",
//!     "amount": "$30.00"
//! }))?;
//! ```

mod store;
mod substitution;

pub use store::{MailTemplate, RenderedMail, TemplateStore, DEFAULT_TEMPLATE};
pub use substitution::{escape_html, substitute_variables};

use thiserror::Error;

/// Template-specific error type
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Template not found: {0}")]
    NotFound(String),

    #[error("Invalid template name: {0}")]
    InvalidName(String),

    #[error("Failed to load templates: {0}")]
    Load(String),
}

/// Result type for template operations
pub type TemplateResult<T> = Result<T, TemplateError>;
