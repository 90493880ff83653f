//! Documents produced by background tasks: invoices and plan manuals.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::membership::{Plan, User};

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot invoice plan {0}: {1}")]
    Invoice(i64, String),
}

/// Writes per-user plan manuals into a scratch directory.
#[derive(Debug, Clone)]
pub struct ManualGenerator {
    tmp_dir: PathBuf,
}

impl ManualGenerator {
    pub fn new(tmp_dir: impl Into<PathBuf>) -> Self {
        Self {
            tmp_dir: tmp_dir.into(),
        }
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    /// Path the manual for `user` is written to
    pub fn manual_path(&self, user: &User) -> PathBuf {
        self.tmp_dir.join(format!("{}_manual.txt", user.id))
    }

    /// Generate the manual for `user` on `plan` and return where it was written
    #[tracing::instrument(name = "documents.manual", skip_all, fields(user_id = user.id, plan_id = plan.id))]
    pub async fn generate(&self, user: &User, plan: &Plan) -> Result<PathBuf, DocumentError> {
        tokio::fs::create_dir_all(&self.tmp_dir)
            .await
            .map_err(|source| DocumentError::Write {
                path: self.tmp_dir.clone(),
                source,
            })?;

        let path = self.manual_path(user);
        tokio::fs::write(&path, render_manual(user, plan))
            .await
            .map_err(|source| DocumentError::Write {
                path: path.clone(),
                source,
            })?;

        tracing::debug!(path = %path.display(), "Manual generated");
        Ok(path)
    }
}

fn render_manual(user: &User, plan: &Plan) -> String {
    format!(
        "{} {}\n\n{} User Guide\n\nMonthly amount: {}\n",
        user.first_name,
        user.last_name,
        plan.plan_name,
        plan.amount_formatted()
    )
}

/// Invoice payload for a subscription, as handed to the `invoice` template
pub fn invoice_for(user: &User, plan: &Plan) -> Result<serde_json::Value, DocumentError> {
    if plan.plan_amount < 0 {
        return Err(DocumentError::Invoice(
            plan.id,
            "negative plan amount".to_string(),
        ));
    }

    Ok(serde_json::json!({
        "first_name": user.first_name,
        "last_name": user.last_name,
        "plan_name": plan.plan_name,
        "amount": plan.amount_formatted(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn user() -> User {
        User {
            id: 7,
            email: "admin@example.com".to_string(),
            first_name: "Admin".to_string(),
            last_name: "User".to_string(),
            active: true,
            is_admin: true,
            plan: None,
            created_at: Utc::now(),
        }
    }

    fn plan(amount: i64) -> Plan {
        Plan {
            id: 1,
            plan_name: "Gold Plan".to_string(),
            plan_amount: amount,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_manual_written_under_tmp_dir() {
        let dir = tempfile::tempdir().unwrap();
        let generator = ManualGenerator::new(dir.path().join("tmp"));

        let path = generator.generate(&user(), &plan(3000)).await.unwrap();

        assert_eq!(path, dir.path().join("tmp").join("7_manual.txt"));
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.starts_with("Admin User"));
        assert!(content.contains("Gold Plan User Guide"));
    }

    #[test]
    fn test_invoice_payload() {
        let invoice = invoice_for(&user(), &plan(3000)).unwrap();
        assert_eq!(invoice["amount"], "$30.00");
        assert_eq!(invoice["plan_name"], "Gold Plan");
    }

    #[test]
    fn test_invoice_rejects_negative_amount() {
        assert!(matches!(
            invoice_for(&user(), &plan(-1)),
            Err(DocumentError::Invoice(1, _))
        ));
    }
}
