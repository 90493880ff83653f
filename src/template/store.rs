//! In-memory template storage

use std::path::Path;

use dashmap::DashMap;
use serde::Serialize;

use super::substitution::{escape_html, no_escape, substitute_variables, variables_for};
use super::{TemplateError, TemplateResult};

/// Template used when a message does not name one
pub const DEFAULT_TEMPLATE: &str = "mail";

const HTML_SUFFIX: &str = ".html.tmpl";
const PLAIN_SUFFIX: &str = ".plain.tmpl";

/// A named mail template
#[derive(Debug, Clone)]
pub struct MailTemplate {
    pub name: String,
    pub html: String,
    pub plain: String,
}

impl MailTemplate {
    pub fn new(name: impl Into<String>, html: impl Into<String>, plain: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            html: html.into(),
            plain: plain.into(),
        }
    }

    fn validate_name(name: &str) -> TemplateResult<()> {
        if name.is_empty() || name.len() > 64 {
            return Err(TemplateError::InvalidName(
                "name must be 1-64 characters".to_string(),
            ));
        }
        if !name.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_') {
            return Err(TemplateError::InvalidName(format!(
                "'{}' must contain only alphanumeric, dash, or underscore",
                name
            )));
        }
        Ok(())
    }
}

/// Final payload of a rendered message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedMail {
    pub html: String,
    pub plain: String,
}

/// Thread-safe store of mail templates
pub struct TemplateStore {
    templates: DashMap<String, MailTemplate>,
}

impl TemplateStore {
    /// Create a store holding the built-in templates
    pub fn new() -> Self {
        let store = Self::empty();
        for template in builtin_templates() {
            store.templates.insert(template.name.clone(), template);
        }
        store
    }

    pub fn empty() -> Self {
        Self {
            templates: DashMap::new(),
        }
    }

    /// Add or replace a template
    pub fn insert(&self, template: MailTemplate) -> TemplateResult<()> {
        MailTemplate::validate_name(&template.name)?;
        self.templates.insert(template.name.clone(), template);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.templates.iter().map(|t| t.key().clone()).collect();
        names.sort();
        names
    }

    /// Load every `<name>.html.tmpl` in `dir`, paired with an optional
    /// `<name>.plain.tmpl`. Returns the number of templates loaded.
    pub async fn load_dir(&self, dir: &Path) -> TemplateResult<usize> {
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| TemplateError::Load(format!("{}: {}", dir.display(), e)))?;
        let mut loaded = 0;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| TemplateError::Load(e.to_string()))?
        {
            let file_name = entry.file_name().to_string_lossy().to_string();
            let Some(name) = file_name.strip_suffix(HTML_SUFFIX) else {
                continue;
            };

            let html = tokio::fs::read_to_string(entry.path())
                .await
                .map_err(|e| TemplateError::Load(format!("{}: {}", file_name, e)))?;
            let plain_path = dir.join(format!("{}{}", name, PLAIN_SUFFIX));
            let plain = match tokio::fs::read_to_string(&plain_path).await {
                Ok(plain) => plain,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
                Err(e) => {
                    return Err(TemplateError::Load(format!(
                        "{}: {}",
                        plain_path.display(),
                        e
                    )))
                }
            };

            self.insert(MailTemplate::new(name, html, plain))?;
            loaded += 1;
        }

        tracing::info!(dir = %dir.display(), loaded, "Mail templates loaded");
        Ok(loaded)
    }

    /// Render `name` with `data` into its HTML and plain-text parts
    pub fn render(&self, name: &str, data: &serde_json::Value) -> TemplateResult<RenderedMail> {
        let template = self
            .templates
            .get(name)
            .ok_or_else(|| TemplateError::NotFound(name.to_string()))?;
        let variables = variables_for(data);

        Ok(RenderedMail {
            html: substitute_variables(&template.html, &variables, escape_html),
            plain: substitute_variables(&template.plain, &variables, no_escape),
        })
    }
}

impl Default for TemplateStore {
    fn default() -> Self {
        Self::new()
    }
}

fn builtin_templates() -> Vec<MailTemplate> {
    vec![
        MailTemplate::new(
            DEFAULT_TEMPLATE,
            "<!doctype html>\n<html>\n<body>\n<p>{{message}}</p>\n</body>\n</html>\n",
            "{{message}}\n",
        ),
        MailTemplate::new(
            "confirmation-email",
            "<!doctype html>\n<html>\n<body>\n<p>Please activate your account.</p>\n<p><a href=\"{{message}}\">Activate</a></p>\n</body>\n</html>\n",
            "Please activate your account by visiting:\n{{message}}\n",
        ),
        MailTemplate::new(
            "invoice",
            "<!doctype html>\n<html>\n<body>\n<p>Thank you for subscribing to {{plan_name}}.</p>\n<p>Amount charged: {{amount}}</p>\n</body>\n</html>\n",
            "Thank you for subscribing to {{plan_name}}.\nAmount charged: {{amount}}\n",
        ),
    ]
}
