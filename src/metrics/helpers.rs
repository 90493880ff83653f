//! Metrics helper structs for convenient metric recording

use prometheus::{Encoder, TextEncoder};

use super::{
    ERRORS_LOGGED_TOTAL, ERRORS_REPORTED_TOTAL, MAIL_DELIVERED_TOTAL, MAIL_DELIVERY_LATENCY,
    MAIL_DROPPED_TOTAL, MAIL_FAILED_TOTAL, MAIL_QUEUED_TOTAL, SHUTDOWN_DRAIN_SECONDS,
    TASKS_IN_FLIGHT, TASKS_SPAWNED_TOTAL, TASK_PANICS_TOTAL,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for recording background task metrics
pub struct TaskMetrics;

impl TaskMetrics {
    /// Record a task being registered with the tracker
    pub fn record_begin() {
        TASKS_IN_FLIGHT.inc();
    }

    /// Record a task releasing its tracker registration
    pub fn record_end() {
        TASKS_IN_FLIGHT.dec();
    }

    /// Record a named task being spawned
    pub fn record_spawned(task: &str) {
        TASKS_SPAWNED_TOTAL.with_label_values(&[task]).inc();
    }

    pub fn record_panic() {
        TASK_PANICS_TOTAL.inc();
    }
}

/// Helper struct for recording mail metrics
pub struct MailMetrics;

impl MailMetrics {
    pub fn record_queued() {
        MAIL_QUEUED_TOTAL.inc();
    }

    /// Record a successful delivery and how long it took
    pub fn record_delivered(latency_secs: f64) {
        MAIL_DELIVERED_TOTAL.inc();
        MAIL_DELIVERY_LATENCY.observe(latency_secs);
    }

    pub fn record_failed() {
        MAIL_FAILED_TOTAL.inc();
    }

    /// Record messages discarded when the dispatcher stops
    pub fn record_dropped(count: u64) {
        MAIL_DROPPED_TOTAL.inc_by(count);
    }
}

/// Helper struct for recording error sink metrics
pub struct ErrorMetrics;

impl ErrorMetrics {
    pub fn record_reported() {
        ERRORS_REPORTED_TOTAL.inc();
    }

    pub fn record_logged() {
        ERRORS_LOGGED_TOTAL.inc();
    }
}

/// Helper struct for recording shutdown metrics
pub struct ShutdownMetrics;

impl ShutdownMetrics {
    pub fn record_drain(secs: f64) {
        SHUTDOWN_DRAIN_SECONDS.observe(secs);
    }
}
