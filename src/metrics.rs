//! Prometheus metrics for the audit pipeline
//!
//! All collectors register into the default registry on first use.
//! `encode_text()` renders everything in the Prometheus text format.
//!
//! # Naming
//!
//! ```text
//! civic_audit_requests_total{outcome}          ← one per question
//! civic_audit_role_calls_total{role,status}    ← one per generation role call
//! civic_audit_sandbox_executions_total{status} ← one per sandbox run
//! civic_audit_bridge_requests_total{method,status}
//! ```

use lazy_static::lazy_static;
use prometheus::{
    register_gauge, register_histogram, register_histogram_vec, register_int_counter,
    register_int_counter_vec, Encoder, Gauge, Histogram, HistogramVec, IntCounter,
    IntCounterVec, TextEncoder,
};

lazy_static! {
    // ── Orchestration ───────────────────────────────────────────────────────

    /// Completed audit requests by outcome (answered, refused, exhausted, error)
    pub static ref AUDIT_REQUESTS: IntCounterVec = register_int_counter_vec!(
        "civic_audit_requests_total",
        "Audit requests by terminal outcome",
        &["outcome"]
    )
    .unwrap();

    /// Generation attempts used per request
    pub static ref AUDIT_ITERATIONS: Histogram = register_histogram!(
        "civic_audit_iterations",
        "Code generation attempts per request",
        vec![1.0, 2.0, 3.0, 4.0, 5.0, 8.0]
    )
    .unwrap();

    /// State machine transitions per request
    pub static ref AUDIT_TRANSITIONS: Histogram = register_histogram!(
        "civic_audit_transitions",
        "Orchestration transitions per request",
        vec![4.0, 8.0, 12.0, 16.0, 24.0, 32.0]
    )
    .unwrap();

    // ── Generation roles ────────────────────────────────────────────────────

    pub static ref ROLE_CALLS: IntCounterVec = register_int_counter_vec!(
        "civic_audit_role_calls_total",
        "Generation role invocations",
        &["role", "status"]
    )
    .unwrap();

    pub static ref ROLE_CALL_DURATION: HistogramVec = register_histogram_vec!(
        "civic_audit_role_call_duration_seconds",
        "Latency of generation role invocations",
        &["role"],
        vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    )
    .unwrap();

    // ── Sandbox ─────────────────────────────────────────────────────────────

    pub static ref SANDBOX_EXECUTIONS: IntCounterVec = register_int_counter_vec!(
        "civic_audit_sandbox_executions_total",
        "Sandbox executions by classified status",
        &["status"]
    )
    .unwrap();

    pub static ref SANDBOX_EXECUTION_DURATION: Histogram = register_histogram!(
        "civic_audit_sandbox_execution_duration_seconds",
        "Wall-clock time from container create to teardown",
        vec![0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 30.0, 60.0]
    )
    .unwrap();

    /// Containers currently alive (created and not yet removed)
    pub static ref SANDBOX_LIVE: Gauge = register_gauge!(
        "civic_audit_sandbox_live",
        "Sandbox environments currently alive"
    )
    .unwrap();

    pub static ref SANDBOX_TEARDOWN_FAILURES: IntCounter = register_int_counter!(
        "civic_audit_sandbox_teardown_failures_total",
        "Container removals that returned an error"
    )
    .unwrap();

    // ── Bridge ──────────────────────────────────────────────────────────────

    pub static ref BRIDGE_REQUESTS: IntCounterVec = register_int_counter_vec!(
        "civic_audit_bridge_requests_total",
        "Bridge requests by method and status",
        &["method", "status"]
    )
    .unwrap();

    pub static ref BRIDGE_CONNECTIONS: IntCounter = register_int_counter!(
        "civic_audit_bridge_connections_total",
        "Accepted bridge connections"
    )
    .unwrap();

    pub static ref BRIDGE_MALFORMED_LINES: IntCounter = register_int_counter!(
        "civic_audit_bridge_malformed_lines_total",
        "Bridge lines dropped because they could not be parsed"
    )
    .unwrap();

    pub static ref BRIDGE_RATE_LIMITED: IntCounter = register_int_counter!(
        "civic_audit_bridge_rate_limited_total",
        "Bridge requests answered with a rate-limit error"
    )
    .unwrap();
}

/// Render every registered metric in the Prometheus text exposition format
pub fn encode_text() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
