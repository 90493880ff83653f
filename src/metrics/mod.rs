//! Prometheus metrics for the membership service.
//!
//! This module provides metrics for the background core:
//! - Task metrics (spawned, in flight, panics)
//! - Mail metrics (queued, delivered, failed, dropped at shutdown, latency)
//! - Error sink metrics (reported, logged)
//! - Shutdown metrics (drain duration)

mod helpers;

pub use helpers::{encode_metrics, ErrorMetrics, MailMetrics, ShutdownMetrics, TaskMetrics};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "membership";

lazy_static! {
    // ============================================================================
    // Task Metrics
    // ============================================================================

    /// Background tasks spawned, by task name
    pub static ref TASKS_SPAWNED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_tasks_spawned_total", METRIC_PREFIX),
        "Total background tasks spawned",
        &["task"]
    ).unwrap();

    /// Background tasks currently registered with the tracker
    pub static ref TASKS_IN_FLIGHT: IntGauge = register_int_gauge!(
        format!("{}_tasks_in_flight", METRIC_PREFIX),
        "Background tasks currently in flight"
    ).unwrap();

    /// Background tasks that terminated by panicking
    pub static ref TASK_PANICS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_task_panics_total", METRIC_PREFIX),
        "Total background tasks that panicked"
    ).unwrap();

    // ============================================================================
    // Mail Metrics
    // ============================================================================

    pub static ref MAIL_QUEUED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_mail_queued_total", METRIC_PREFIX),
        "Total messages accepted into the dispatcher queue"
    ).unwrap();

    pub static ref MAIL_DELIVERED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_mail_delivered_total", METRIC_PREFIX),
        "Total messages handed to the delivery backend successfully"
    ).unwrap();

    pub static ref MAIL_FAILED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_mail_failed_total", METRIC_PREFIX),
        "Total messages whose rendering or delivery failed"
    ).unwrap();

    /// Messages still queued when the dispatcher was stopped
    pub static ref MAIL_DROPPED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_mail_dropped_total", METRIC_PREFIX),
        "Total queued messages discarded at shutdown"
    ).unwrap();

    /// Messages waiting in the dispatcher queue, sampled on scrape
    pub static ref MAIL_QUEUE_DEPTH: IntGauge = register_int_gauge!(
        format!("{}_mail_queue_depth", METRIC_PREFIX),
        "Messages currently waiting in the dispatcher queue"
    ).unwrap();

    pub static ref MAIL_DELIVERY_LATENCY: Histogram = register_histogram!(
        format!("{}_mail_delivery_latency_seconds", METRIC_PREFIX),
        "Time spent rendering and delivering one message",
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]
    ).unwrap();

    // ============================================================================
    // Error Sink Metrics
    // ============================================================================

    pub static ref ERRORS_REPORTED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_errors_reported_total", METRIC_PREFIX),
        "Total errors submitted to the error sink"
    ).unwrap();

    pub static ref ERRORS_LOGGED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_errors_logged_total", METRIC_PREFIX),
        "Total errors logged by the error sink consumer"
    ).unwrap();

    // ============================================================================
    // Shutdown Metrics
    // ============================================================================

    pub static ref SHUTDOWN_DRAIN_SECONDS: Histogram = register_histogram!(
        format!("{}_shutdown_drain_seconds", METRIC_PREFIX),
        "Time spent waiting for background tasks during shutdown",
        vec![0.01, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0]
    ).unwrap();
}
