//! Metrics definitions for the Call Controller.
//!
//! All metrics follow Prometheus naming conventions:
//! - `cc_` prefix for Call Controller
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded by closed enums: call statuses (10), signal kinds (3),
//! sweeper item kinds (2), error kinds (7), registry operations (~15).
//! No label carries a call or user id.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the Prometheus recorder and return the handle used by `/metrics`.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Registry round trips (p99 < 50ms target)
        .set_buckets_for_metric(
            Matcher::Prefix("cc_db_query".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set registry query buckets: {e}"))?
        // Sweeper passes, can run long under backlog
        .set_buckets_for_metric(
            Matcher::Prefix("cc_sweep_duration".to_string()),
            &[0.010, 0.050, 0.100, 0.500, 1.000, 5.000, 10.000, 30.000],
        )
        .map_err(|e| format!("Failed to set sweep duration buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

/// Set the number of calls with a live Session Cache entry.
///
/// Metric: `cc_calls_active`
pub fn set_calls_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("cc_calls_active").set(count as f64);
}

/// Record a call status transition.
///
/// Metric: `cc_call_transitions_total`
/// Labels: `to` (target status)
pub fn record_call_transition(to: &'static str) {
    counter!("cc_call_transitions_total", "to" => to).increment(1);
}

/// Record a relayed (or rejected) signaling message.
///
/// Metric: `cc_signals_relayed_total`
/// Labels: `kind` (offer_answer, ice_candidate, media), `outcome` (queued, rejected)
pub fn record_signal(kind: &'static str, outcome: &'static str) {
    counter!("cc_signals_relayed_total", "kind" => kind, "outcome" => outcome).increment(1);
}

/// Record one sweeper item.
///
/// Metric: `cc_sweeper_items_total`
/// Labels: `kind` (stale_call, invitation), `outcome` (applied, skipped, error)
pub fn record_sweeper_item(kind: &'static str, outcome: &'static str) {
    counter!("cc_sweeper_items_total", "kind" => kind, "outcome" => outcome).increment(1);
}

/// Record how long one sweeper pass took.
///
/// Metric: `cc_sweep_duration_seconds`
pub fn record_sweep_duration(duration: Duration) {
    histogram!("cc_sweep_duration_seconds").record(duration.as_secs_f64());
}

/// Record registry query latency.
///
/// Metric: `cc_db_query_duration_seconds`
/// Labels: `operation`, `status` (success, error)
pub fn record_db_query(operation: &'static str, status: &'static str, duration: Duration) {
    histogram!("cc_db_query_duration_seconds",
        "operation" => operation,
        "status" => status
    )
    .record(duration.as_secs_f64());
}

/// Set the mailbox depth for an actor type.
///
/// Metric: `cc_actor_mailbox_depth`
/// Labels: `actor_type` (controller, call)
pub fn set_actor_mailbox_depth(actor_type: &'static str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("cc_actor_mailbox_depth", "actor_type" => actor_type).set(depth as f64);
}

/// Record an actor panic. Any non-zero value is a bug.
///
/// Metric: `cc_actor_panics_total`
/// Labels: `actor_type`
pub fn record_actor_panic(actor_type: &'static str) {
    counter!("cc_actor_panics_total", "actor_type" => actor_type).increment(1);
}

/// Set the number of open gateway sockets.
///
/// Metric: `cc_gateway_connections`
pub fn set_gateway_connections(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("cc_gateway_connections").set(count as f64);
}

/// Record one client frame handled by the gateway.
///
/// Metric: `cc_gateway_frames_total`
/// Labels: `op` (client frame type), `outcome` (ok, error, malformed)
pub fn record_gateway_frame(op: &'static str, outcome: &'static str) {
    counter!("cc_gateway_frames_total", "op" => op, "outcome" => outcome).increment(1);
}

/// Record an outbound frame dropped because the socket's queue was full
/// or closed.
///
/// Metric: `cc_gateway_frames_dropped_total`
pub fn record_gateway_drop() {
    counter!("cc_gateway_frames_dropped_total").increment(1);
}

/// Record an error returned to a caller.
///
/// Metric: `cc_errors_total`
/// Labels: `kind` (see `CcError::kind`)
pub fn record_error(kind: &'static str) {
    counter!("cc_errors_total", "kind" => kind).increment(1);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    #[test]
    fn test_recording_without_recorder_is_noop() {
        set_calls_active(3);
        record_call_transition("connecting");
        record_signal("offer_answer", "queued");
        record_sweeper_item("stale_call", "applied");
        record_sweep_duration(Duration::from_millis(12));
        record_db_query("find_call", "success", Duration::from_millis(2));
        set_actor_mailbox_depth("call", 4);
        record_actor_panic("call");
        record_error("not_found");
        set_gateway_connections(2);
        record_gateway_frame("join_call", "ok");
        record_gateway_drop();
    }

    #[test]
    fn test_transition_counter_is_labeled_by_target() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_call_transition("ended");
            record_call_transition("ended");
            record_call_transition("connecting");
        });

        let snapshot = snapshotter.snapshot().into_vec();
        let ended = snapshot
            .iter()
            .find(|(key, _, _, _)| {
                key.key().name() == "cc_call_transitions_total"
                    && key.key().labels().any(|l| l.value() == "ended")
            })
            .map(|(_, _, _, value)| value.clone())
            .expect("ended transitions recorded");
        assert_eq!(*ended, DebugValue::Counter(2));
    }
}
