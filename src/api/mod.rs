//! API layer - HTTP endpoint handlers organized by domain.

mod handlers;
mod health;
mod metrics;
mod routes;

pub use handlers::{
    list_plans, login_failure, register, subscribe, LoginFailureRequest, PlansResponse,
    RegisterRequest, SubscribeRequest,
};
pub use health::{health, stats};
pub use metrics::prometheus_metrics;
pub use routes::api_routes;
