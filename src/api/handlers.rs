//! Membership endpoints. Each one finishes its synchronous work, hands
//! anything slow to a background task, and responds.

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::membership::{NewUser, Plan, User};
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct PlansResponse {
    pub plans: Vec<Plan>,
    pub total: usize,
}

#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    pub email: String,
    pub plan_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginFailureRequest {
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct AcceptedResponse {
    pub status: &'static str,
}

/// GET /api/v1/plans - List available plans
#[tracing::instrument(name = "http.list_plans", skip(state))]
pub async fn list_plans(State(state): State<AppState>) -> Result<Json<PlansResponse>> {
    let plans = state.membership.plans().await?;
    let total = plans.len();
    Ok(Json(PlansResponse { plans, total }))
}

/// POST /api/v1/subscriptions - Subscribe a user to a plan
///
/// The invoice and the plan manual are mailed in the background; the
/// response does not wait for either.
#[tracing::instrument(
    name = "http.subscribe",
    skip(state, request),
    fields(plan_id = request.plan_id)
)]
pub async fn subscribe(
    State(state): State<AppState>,
    Json(request): Json<SubscribeRequest>,
) -> Result<Json<User>> {
    let email = require_email(&request.email)?;
    let user = state
        .membership
        .subscribe_to_plan(email, request.plan_id)
        .await?;
    Ok(Json(user))
}

/// POST /api/v1/registrations - Create an account and mail its activation link
#[tracing::instrument(name = "http.register", skip(state, request))]
pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<User>)> {
    let email = require_email(&request.email)?;
    let first_name = request.first_name.trim();
    let last_name = request.last_name.trim();
    if first_name.is_empty() || last_name.is_empty() {
        return Err(AppError::Validation(
            "first_name and last_name are required".to_string(),
        ));
    }

    let user = state
        .membership
        .register(NewUser {
            email: email.to_string(),
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
        })
        .await?;
    Ok((StatusCode::CREATED, Json(user)))
}

/// POST /api/v1/login-failures - Notify a user about a failed login
#[tracing::instrument(name = "http.login_failure", skip(state, request))]
pub async fn login_failure(
    State(state): State<AppState>,
    Json(request): Json<LoginFailureRequest>,
) -> Result<(StatusCode, Json<AcceptedResponse>)> {
    let email = require_email(&request.email)?;
    state.membership.notify_failed_login(email)?;
    Ok((StatusCode::ACCEPTED, Json(AcceptedResponse { status: "queued" })))
}

fn require_email(email: &str) -> Result<&str> {
    let email = email.trim();
    if email.is_empty() {
        return Err(AppError::Validation("email is required".to_string()));
    }
    Ok(email)
}
