use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;

use super::{NewUser, Plan, User};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("plan not found: {0}")]
    PlanNotFound(i64),

    #[error("a user with email {0} already exists")]
    DuplicateEmail(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// User and plan persistence.
///
/// Called synchronously from request handlers before any background work
/// is spawned; tasks only ever see plain copies of the returned values.
#[async_trait]
pub trait MembershipRepository: Send + Sync {
    async fn get_by_email(&self, email: &str) -> Result<User, RepositoryError>;

    async fn get_one(&self, id: i64) -> Result<User, RepositoryError>;

    /// Store a new, inactive, non-admin user and return it with its id
    async fn insert(&self, new_user: &NewUser) -> Result<User, RepositoryError>;

    /// All available plans, ordered by id
    async fn get_all(&self) -> Result<Vec<Plan>, RepositoryError>;

    async fn get_plan(&self, id: i64) -> Result<Plan, RepositoryError>;

    async fn subscribe_user_to_plan(&self, user_id: i64, plan_id: i64)
        -> Result<(), RepositoryError>;
}

/// In-memory repository
#[derive(Debug, Default)]
pub struct MemoryRepository {
    users: DashMap<i64, User>,
    emails: DashMap<String, i64>,
    plans: DashMap<i64, Plan>,
    next_user_id: AtomicI64,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self {
            next_user_id: AtomicI64::new(1),
            ..Self::default()
        }
    }

    /// Repository seeded with the standard plans and an admin account
    pub fn with_demo_data() -> Self {
        let repo = Self::new();
        for (id, name, amount) in [
            (1, "Bronze Plan", 1000),
            (2, "Silver Plan", 2000),
            (3, "Gold Plan", 3000),
        ] {
            repo.insert_plan(Plan {
                id,
                plan_name: name.to_string(),
                plan_amount: amount,
                created_at: Utc::now(),
            });
        }
        // Fresh repository, so the address cannot collide
        let _ = repo.insert_user("admin@example.com", "Admin", "User", true);
        repo
    }

    pub fn insert_plan(&self, plan: Plan) {
        self.plans.insert(plan.id, plan);
    }

    /// Add an active user and return it with its assigned id
    pub fn insert_user(
        &self,
        email: &str,
        first_name: &str,
        last_name: &str,
        is_admin: bool,
    ) -> Result<User, RepositoryError> {
        let new_user = NewUser {
            email: email.to_string(),
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
        };
        self.store(&new_user, true, is_admin)
    }

    fn store(
        &self,
        new_user: &NewUser,
        active: bool,
        is_admin: bool,
    ) -> Result<User, RepositoryError> {
        let email = new_user.email.trim().to_lowercase();
        match self.emails.entry(email.clone()) {
            Entry::Occupied(_) => Err(RepositoryError::DuplicateEmail(email)),
            Entry::Vacant(slot) => {
                let id = self.next_user_id.fetch_add(1, Ordering::SeqCst);
                let user = User {
                    id,
                    email,
                    first_name: new_user.first_name.trim().to_string(),
                    last_name: new_user.last_name.trim().to_string(),
                    active,
                    is_admin,
                    plan: None,
                    created_at: Utc::now(),
                };
                self.users.insert(id, user.clone());
                slot.insert(id);
                Ok(user)
            }
        }
    }
}

#[async_trait]
impl MembershipRepository for MemoryRepository {
    async fn get_by_email(&self, email: &str) -> Result<User, RepositoryError> {
        let email = email.trim().to_lowercase();
        self.emails
            .get(&email)
            .and_then(|id| self.users.get(id.value()).map(|u| u.value().clone()))
            .ok_or(RepositoryError::UserNotFound(email))
    }

    async fn get_one(&self, id: i64) -> Result<User, RepositoryError> {
        self.users
            .get(&id)
            .map(|u| u.value().clone())
            .ok_or_else(|| RepositoryError::UserNotFound(id.to_string()))
    }

    async fn insert(&self, new_user: &NewUser) -> Result<User, RepositoryError> {
        self.store(new_user, false, false)
    }

    async fn get_all(&self) -> Result<Vec<Plan>, RepositoryError> {
        let mut plans: Vec<Plan> = self.plans.iter().map(|p| p.value().clone()).collect();
        plans.sort_by_key(|p| p.id);
        Ok(plans)
    }

    async fn get_plan(&self, id: i64) -> Result<Plan, RepositoryError> {
        self.plans
            .get(&id)
            .map(|p| p.value().clone())
            .ok_or(RepositoryError::PlanNotFound(id))
    }

    async fn subscribe_user_to_plan(
        &self,
        user_id: i64,
        plan_id: i64,
    ) -> Result<(), RepositoryError> {
        let plan = self.get_plan(plan_id).await?;
        let mut user = self
            .users
            .get_mut(&user_id)
            .ok_or_else(|| RepositoryError::UserNotFound(user_id.to_string()))?;
        user.plan = Some(plan);
        Ok(())
    }
}
