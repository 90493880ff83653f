use std::sync::Arc;

use crate::documents::{invoice_for, ManualGenerator};
use crate::error::{AppError, Result};
use crate::mail::{MailError, Mailer, Message};
use crate::shutdown::ShutdownHandle;
use crate::tasks::{TaskGuard, TaskSpawner};

use super::{MembershipRepository, NewUser, Plan, User};

/// Request-side membership flows.
///
/// Everything that can fail synchronously (lookups, the subscription write)
/// happens before background work starts. The background tasks receive
/// cloned values and report their own failures to the error sink.
#[derive(Clone)]
pub struct MembershipService {
    repo: Arc<dyn MembershipRepository>,
    spawner: TaskSpawner,
    mailer: Mailer,
    manuals: ManualGenerator,
    shutdown: ShutdownHandle,
}

impl MembershipService {
    pub fn new(
        repo: Arc<dyn MembershipRepository>,
        spawner: TaskSpawner,
        mailer: Mailer,
        manuals: ManualGenerator,
        shutdown: ShutdownHandle,
    ) -> Self {
        Self {
            repo,
            spawner,
            mailer,
            manuals,
            shutdown,
        }
    }

    pub async fn plans(&self) -> Result<Vec<Plan>> {
        Ok(self.repo.get_all().await?)
    }

    /// Subscribe `email` to `plan_id`, then mail the invoice and the plan
    /// manual in the background. Returns the updated user.
    ///
    /// Both task slots are taken before the repository is touched, so a
    /// shutdown that starts while the lookups are pending still waits for
    /// the two mails. Once the tracker is closed the request fails with
    /// [`AppError::Unavailable`] and nothing is written.
    #[tracing::instrument(name = "membership.subscribe", skip(self))]
    pub async fn subscribe_to_plan(&self, email: &str, plan_id: i64) -> Result<User> {
        self.ensure_accepting()?;
        let invoice_slot = self.spawner.reserve()?;
        let manual_slot = self.spawner.reserve()?;

        let plan = self.repo.get_plan(plan_id).await?;
        let user = self.repo.get_by_email(email).await?;
        self.repo.subscribe_user_to_plan(user.id, plan.id).await?;

        self.spawn_invoice(invoice_slot, user.clone(), plan.clone());
        self.spawn_manual(manual_slot, user.clone(), plan.clone());

        tracing::info!(
            user_id = user.id,
            plan = %plan.plan_name,
            "User subscribed to plan"
        );

        Ok(self.repo.get_one(user.id).await?)
    }

    /// Create an inactive account and mail its activation link.
    #[tracing::instrument(name = "membership.register", skip_all, fields(email = %new_user.email))]
    pub async fn register(&self, new_user: NewUser) -> Result<User> {
        self.ensure_accepting()?;
        let slot = self.spawner.reserve()?;

        // Built first so a bad address is rejected before anything is stored
        let message = Message::builder(new_user.email.trim(), "Activate your account")
            .template("confirmation-email")
            .data(activation_url(&new_user.email))
            .build()
            .map_err(invalid_message)?;

        let user = self.repo.insert(&new_user).await?;
        self.mailer.send_reserved(&self.spawner, slot, message);

        tracing::info!(user_id = user.id, "User registered");
        Ok(user)
    }

    /// Tell `email` that a login attempt failed. The mail is queued from a
    /// tracked task so the caller never waits on a full queue.
    pub fn notify_failed_login(&self, email: &str) -> Result<()> {
        self.ensure_accepting()?;

        let message = Message::builder(email, "Failed login attempt")
            .data("Invalid login!")
            .build()
            .map_err(invalid_message)?;

        self.mailer.send_tracked(&self.spawner, message)?;
        Ok(())
    }

    fn spawn_invoice(&self, slot: TaskGuard, user: User, plan: Plan) {
        let mailer = self.mailer.clone();
        self.spawner.spawn_reserved(slot, "invoice", async move {
            let invoice = invoice_for(&user, &plan)?;
            let message = Message::builder(user.email.as_str(), "User Invoice")
                .template("invoice")
                .data(invoice)
                .build()?;
            mailer.send(message).await?;
            Ok(())
        });
    }

    fn spawn_manual(&self, slot: TaskGuard, user: User, plan: Plan) {
        let mailer = self.mailer.clone();
        let manuals = self.manuals.clone();
        self.spawner.spawn_reserved(slot, "manual", async move {
            let path = manuals.generate(&user, &plan).await?;
            let message = Message::builder(user.email.as_str(), "Your Manual")
                .data("Please see attached")
                .attach("manual.txt", path)
                .build()?;
            mailer.send(message).await?;
            Ok(())
        });
    }

    fn ensure_accepting(&self) -> Result<()> {
        if self.shutdown.is_running() {
            Ok(())
        } else {
            Err(AppError::Unavailable(
                "server is shutting down".to_string(),
            ))
        }
    }
}

/// Link mailed to a new account. Not signed.
fn activation_url(email: &str) -> String {
    format!("http://localhost/activate?email={}", email.trim().to_lowercase())
}

fn invalid_message(err: MailError) -> AppError {
    match err {
        MailError::InvalidAddress(msg) => AppError::Validation(msg),
        other => AppError::Internal(other.to_string()),
    }
}
