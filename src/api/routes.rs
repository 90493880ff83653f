use axum::{
    routing::{get, post},
    Router,
};

use crate::server::AppState;

use super::handlers::{list_plans, login_failure, register, subscribe};
use super::health::{health, stats};
use super::metrics::prometheus_metrics;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        // Health & Stats
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/metrics", get(prometheus_metrics))
        // Membership endpoints
        .nest(
            "/api/v1",
            Router::new()
                .route("/plans", get(list_plans))
                .route("/registrations", post(register))
                .route("/subscriptions", post(subscribe))
                .route("/login-failures", post(login_failure)),
        )
}
