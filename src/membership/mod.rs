//! Membership collaborators: users, plans and the flows that start
//! background work for them.

mod repository;
mod service;
mod types;

pub use repository::{MembershipRepository, MemoryRepository, RepositoryError};
pub use service::MembershipService;
pub use types::{NewUser, Plan, User};
