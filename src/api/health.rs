//! Health check and statistics endpoints.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::error_sink::ErrorRecord;
use crate::mail::MailerStatsSnapshot;
use crate::server::AppState;
use crate::shutdown::ShutdownState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub shutdown: ShutdownState,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub tasks: TaskStats,
    pub mail: MailerStatsSnapshot,
    pub errors: ErrorStats,
    pub shutdown: ShutdownState,
}

#[derive(Debug, Serialize)]
pub struct TaskStats {
    pub in_flight: usize,
}

#[derive(Debug, Serialize)]
pub struct ErrorStats {
    pub reported: u64,
    pub logged: u64,
    pub recent: Vec<ErrorRecord>,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let shutdown = state.background.shutdown.state();
    let status = if shutdown == ShutdownState::Running {
        "healthy"
    } else {
        "shutting_down"
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        shutdown,
    })
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let background = &state.background;

    Json(StatsResponse {
        tasks: TaskStats {
            in_flight: background.tracker.in_flight(),
        },
        mail: background.mailer.stats(),
        errors: ErrorStats {
            reported: background.errors.reported(),
            logged: background.errors.logged(),
            recent: background.errors.recent(),
        },
        shutdown: background.shutdown.state(),
    })
}
