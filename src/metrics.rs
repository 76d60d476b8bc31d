//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Pull progress (documents, batches, checkpoint persists)
//! - Push outcomes (published, conflicts, skipped, errors, resubmissions)
//! - Long-poll requests and backoff
//! - Remote request latency
//! - Circuit breaker state
//! - Replication lifecycle state and leadership
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replication_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! Every per-replication metric carries a `replication_id` label.
//!
//! # Usage
//!
//! ```rust,no_run
//! use kinto_replication::metrics;
//! use std::time::Duration;
//!
//! // After importing a pulled page
//! metrics::record_pull_batch("todos", 42);
//!
//! // After classifying a batch write
//! metrics::record_push_result("todos", 10, 1, 0, 0, Duration::from_millis(50));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Pull Metrics
// =============================================================================

/// Record one imported page of remote changes.
pub fn record_pull_batch(replication_id: &str, documents: usize) {
    let id = replication_id.to_string();
    counter!("replication_pull_batches_total", "replication_id" => id.clone()).increment(1);
    counter!("replication_pull_documents_total", "replication_id" => id.clone())
        .increment(documents as u64);
    histogram!("replication_pull_batch_size", "replication_id" => id).record(documents as f64);
}

/// Record a checkpoint persist attempt.
pub fn record_checkpoint_persist(replication_id: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "replication_checkpoint_persists_total",
        "replication_id" => replication_id.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record a SQLite busy retry in the checkpoint store.
pub fn checkpoint_retries_total(operation: &str) {
    counter!("replication_checkpoint_retries_total", "operation" => operation.to_string())
        .increment(1);
}

// =============================================================================
// Push Metrics
// =============================================================================

/// Record the classified outcome of one push.
pub fn record_push_result(
    replication_id: &str,
    published: usize,
    conflicts: usize,
    skipped: usize,
    errors: usize,
    duration: Duration,
) {
    let id = replication_id.to_string();

    counter!("replication_push_published_total", "replication_id" => id.clone())
        .increment(published as u64);
    counter!("replication_push_conflicts_total", "replication_id" => id.clone())
        .increment(conflicts as u64);
    counter!("replication_push_skipped_total", "replication_id" => id.clone())
        .increment(skipped as u64);

    if errors > 0 {
        counter!("replication_push_errors_total", "replication_id" => id.clone())
            .increment(errors as u64);
    }

    histogram!("replication_push_duration_seconds", "replication_id" => id.clone())
        .record(duration.as_secs_f64());
    histogram!("replication_push_size", "replication_id" => id)
        .record((published + conflicts + skipped + errors) as f64);
}

/// Record rows resubmitted as creates.
pub fn record_resubmissions(replication_id: &str, count: usize) {
    if count > 0 {
        counter!("replication_push_resubmissions_total", "replication_id" => replication_id.to_string())
            .increment(count as u64);
    }
}

/// Record how a conflict was settled (`equal`, `resolved`, `unresolved`).
pub fn record_conflict_resolution(replication_id: &str, resolver: &str, outcome: &str) {
    counter!(
        "replication_conflict_resolutions_total",
        "replication_id" => replication_id.to_string(),
        "resolver" => resolver.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// =============================================================================
// Long-Poll Metrics
// =============================================================================

/// Record one long-poll request and whether it delivered changes.
pub fn record_longpoll_request(replication_id: &str, outcome: &str) {
    counter!(
        "replication_longpoll_requests_total",
        "replication_id" => replication_id.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a backoff sleep after a failed request.
pub fn record_backoff(replication_id: &str, delay: Duration, failures: usize) {
    let id = replication_id.to_string();
    histogram!("replication_backoff_seconds", "replication_id" => id.clone())
        .record(delay.as_secs_f64());
    gauge!("replication_consecutive_failures", "replication_id" => id).set(failures as f64);
}

// =============================================================================
// Remote Request Metrics
// =============================================================================

/// Record latency of a remote operation (`info`, `list_changes`, `batch_write`, ...).
pub fn record_remote_latency(operation: &str, duration: Duration) {
    histogram!("replication_remote_request_seconds", "operation" => operation.to_string())
        .record(duration.as_secs_f64());
}

/// Record a failed remote operation by error kind.
pub fn record_remote_error(operation: &str, kind: &str) {
    counter!(
        "replication_remote_errors_total",
        "operation" => operation.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record an error emitted on the error stream.
pub fn record_error(replication_id: &str, source: &str, kind: &str) {
    counter!(
        "replication_errors_total",
        "replication_id" => replication_id.to_string(),
        "source" => source.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

// =============================================================================
// Lifecycle Metrics
// =============================================================================

/// Gauge for replication state.
pub fn set_replication_state(replication_id: &str, state: &str) {
    // Encoded numerically for alerting
    let value = match state {
        "idle" => 0.0,
        "starting" => 1.0,
        "paused" => 2.0,
        "pulling" => 3.0,
        "pushing" => 4.0,
        "polling" => 5.0,
        "stopping" => 6.0,
        "stopped" => 7.0,
        "errored" => 8.0,
        _ => -1.0,
    };
    gauge!("replication_state", "replication_id" => replication_id.to_string()).set(value);
}

/// Gauge for leadership (1 = leader).
pub fn set_leader(replication_id: &str, is_leader: bool) {
    gauge!("replication_is_leader", "replication_id" => replication_id.to_string())
        .set(if is_leader { 1.0 } else { 0.0 });
}

/// Gauge for the number of managed replications.
pub fn set_active_replications(count: usize) {
    gauge!("replication_active").set(count as f64);
}

// =============================================================================
// Circuit Breaker Metrics
// =============================================================================

/// Record circuit breaker call outcome.
pub fn record_circuit_call(circuit_name: &str, outcome: &str) {
    counter!(
        "replication_circuit_calls_total",
        "circuit" => circuit_name.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set circuit breaker state gauge (0=closed, 1=half_open, 2=open).
pub fn set_circuit_state(circuit_name: &str, state: &str) {
    let value = match state {
        "closed" => 0.0,
        "half_open" => 1.0,
        "open" => 2.0,
        _ => -1.0,
    };
    gauge!("replication_circuit_state", "circuit" => circuit_name.to_string()).set(value);
}
