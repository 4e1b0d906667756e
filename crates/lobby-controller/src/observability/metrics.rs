//! Metrics definitions for the lobby controller.
//!
//! All metrics follow Prometheus naming conventions:
//! - `lobby_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the Prometheus recorder and return its handle.
///
/// Must be called before any metrics are recorded. Only the host binary
/// calls this; library users install whatever recorder they like.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Backend round trips: loopback is sub-millisecond, matchmaking services are seconds
        .set_buckets_for_metric(
            Matcher::Prefix("lobby_enter_duration".to_string()),
            &[
                0.001, 0.005, 0.010, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.000,
            ],
        )
        .map_err(|e| format!("Failed to set enter duration buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Session Metrics
// ============================================================================

/// Record the outcome of a create/join attempt.
///
/// Metric: `lobby_enter_total`
/// Labels: `kind` (create, join), `outcome` (success or an `EnterFailure` label)
///
/// Cardinality: 10 (2 kinds x 5 outcomes)
pub fn record_enter(kind: &str, outcome: &str) {
    counter!("lobby_enter_total",
        "kind" => kind.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record how long the backend took to answer a create/join.
///
/// Metric: `lobby_enter_duration_seconds`
/// Labels: `kind`
pub fn record_enter_duration(kind: &str, duration: Duration) {
    histogram!("lobby_enter_duration_seconds", "kind" => kind.to_string())
        .record(duration.as_secs_f64());
}

/// Record the end of a session.
///
/// Metric: `lobby_leave_total`
/// Labels: `reason` (user_requested, kicked, owner_stopped_responding, lobby_closed)
pub fn record_leave(reason: &str) {
    counter!("lobby_leave_total", "reason" => reason.to_string()).increment(1);
}

// ============================================================================
// Heartbeat Metrics
// ============================================================================

/// Record a subscribed member timing out.
///
/// Metric: `lobby_heartbeat_timeouts_total`
/// Labels: `role` (owner: we evicted a member, member: our owner vanished)
pub fn record_heartbeat_timeout(role: &str) {
    counter!("lobby_heartbeat_timeouts_total", "role" => role.to_string()).increment(1);
}

// ============================================================================
// Provider Lifecycle Metrics
// ============================================================================

/// Record an orphaned lobby left during attach.
///
/// Metric: `lobby_stale_sessions_flushed_total`
pub fn record_stale_session_flushed() {
    counter!("lobby_stale_sessions_flushed_total").increment(1);
}

/// Set the number of obsolete backends waiting for in-flight calls.
///
/// Metric: `lobby_providers_draining`
///
/// Sustained non-zero values mean a backend call never completed.
pub fn set_providers_draining(count: usize) {
    // usize to f64 conversion is safe for realistic counts
    #[allow(clippy::cast_precision_loss)]
    gauge!("lobby_providers_draining").set(count as f64);
}

// ============================================================================
// Error Metrics
// ============================================================================

/// Record an observer callback that panicked.
///
/// Metric: `lobby_observer_faults_total`
///
/// ALERT: Any non-zero value indicates a bug in a view.
pub fn record_observer_fault() {
    counter!("lobby_observer_faults_total").increment(1);
}

/// Record a host policy callback that panicked.
///
/// Metric: `lobby_policy_faults_total`
/// Labels: `policy` (already_in_lobby, enter_failure)
pub fn record_policy_fault(policy: &str) {
    counter!("lobby_policy_faults_total", "policy" => policy.to_string()).increment(1);
}

/// Record a ledger persistence failure.
///
/// Metric: `lobby_ledger_errors_total`
/// Labels: `operation` (record, erase, load)
pub fn record_ledger_error(operation: &str) {
    counter!("lobby_ledger_errors_total", "operation" => operation.to_string()).increment(1);
}
