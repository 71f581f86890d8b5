// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Push queue delivery and drops
//! - Operation apply outcomes
//! - Pull sweep progress and cursor position
//! - Peer health probing
//! - Repair cycles and blob transfers
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `blobmesh_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! No exporter is installed by the crate; the embedding binary decides.
//!
//! # Usage
//!
//! ```rust,no_run
//! use blobmesh::metrics;
//! use std::time::Duration;
//!
//! metrics::record_push("http://node2:4000", true, Duration::from_millis(12));
//! metrics::record_sweep("http://node2:4000", 42, 40, 2, Duration::from_millis(300));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Push
// =============================================================================

/// Record one push attempt to a peer.
pub fn record_push(peer: &str, success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!("blobmesh_push_total", "peer" => peer.to_string(), "status" => status).increment(1);
    histogram!("blobmesh_push_duration_seconds", "peer" => peer.to_string())
        .record(duration.as_secs_f64());
}

/// Record a push dropped because the peer's queue was full.
pub fn record_push_dropped(peer: &str) {
    counter!("blobmesh_push_dropped_total", "peer" => peer.to_string()).increment(1);
}

/// Current depth of a peer's outbound queue.
pub fn set_push_queue_depth(peer: &str, depth: usize) {
    gauge!("blobmesh_push_queue_depth", "peer" => peer.to_string()).set(depth as f64);
}

// =============================================================================
// Apply
// =============================================================================

/// Record an operation apply outcome ("applied", "duplicate", "malformed", "error").
pub fn record_apply(origin: &str, outcome: &str) {
    counter!(
        "blobmesh_ops_applied_total",
        "origin" => origin.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a locally originated operation.
pub fn record_local_op(op_type: &str) {
    counter!("blobmesh_local_ops_total", "op_type" => op_type.to_string()).increment(1);
}

/// Record SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn store_retries_total(operation: &str) {
    counter!("blobmesh_store_retries_total", "operation" => operation.to_string()).increment(1);
}

// =============================================================================
// Sweep
// =============================================================================

/// Record a completed sweep against one peer.
pub fn record_sweep(peer: &str, fetched: usize, applied: usize, duplicates: usize, duration: Duration) {
    counter!("blobmesh_sweeps_total", "peer" => peer.to_string()).increment(1);
    counter!("blobmesh_sweep_ops_fetched_total", "peer" => peer.to_string()).increment(fetched as u64);
    counter!("blobmesh_sweep_ops_applied_total", "peer" => peer.to_string()).increment(applied as u64);
    counter!("blobmesh_sweep_ops_duplicate_total", "peer" => peer.to_string()).increment(duplicates as u64);
    histogram!("blobmesh_sweep_duration_seconds", "peer" => peer.to_string())
        .record(duration.as_secs_f64());
}

/// Record a sweep that failed before applying anything (cursor or fetch error).
pub fn record_sweep_failed(peer: &str, stage: &str) {
    counter!(
        "blobmesh_sweep_failures_total",
        "peer" => peer.to_string(),
        "stage" => stage.to_string()
    )
    .increment(1);
}

/// Record a sweep batch that halted on a failed apply.
pub fn record_sweep_halted(peer: &str) {
    counter!("blobmesh_sweep_halted_total", "peer" => peer.to_string()).increment(1);
}

/// Record a cursor advance; the gauge holds the cursor as unix seconds.
pub fn record_cursor_advance(peer: &str, cursor_unix_secs: f64) {
    counter!("blobmesh_cursor_advances_total", "peer" => peer.to_string()).increment(1);
    gauge!("blobmesh_cursor_position_seconds", "peer" => peer.to_string()).set(cursor_unix_secs);
}

// =============================================================================
// Health
// =============================================================================

/// Record one health probe.
pub fn record_health_probe(peer: &str, success: bool, latency: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!("blobmesh_health_probes_total", "peer" => peer.to_string(), "status" => status).increment(1);
    if success {
        histogram!("blobmesh_health_probe_latency_seconds", "peer" => peer.to_string())
            .record(latency.as_secs_f64());
    }
}

/// Gauge for peer status (1=healthy, 0=unknown, -1=down).
pub fn set_peer_status(peer: &str, status: &str) {
    let value = match status {
        "healthy" => 1.0,
        "unknown" => 0.0,
        "down" => -1.0,
        _ => 0.0,
    };
    gauge!("blobmesh_peer_status", "peer" => peer.to_string()).set(value);
}

/// Gauge for number of peers currently healthy.
pub fn set_healthy_peers(count: usize) {
    gauge!("blobmesh_healthy_peers").set(count as f64);
}

// =============================================================================
// Repair
// =============================================================================

/// Record repair cycle completion.
pub fn record_repair_cycle(
    keys_checked: usize,
    pulled: usize,
    pushed: usize,
    over_replicated: usize,
    errors: usize,
    duration: Duration,
) {
    counter!("blobmesh_repair_cycles_total").increment(1);
    counter!("blobmesh_repair_keys_checked_total").increment(keys_checked as u64);
    counter!("blobmesh_repair_pulled_total").increment(pulled as u64);
    counter!("blobmesh_repair_pushed_total").increment(pushed as u64);
    gauge!("blobmesh_repair_over_replicated").set(over_replicated as f64);

    if errors > 0 {
        counter!("blobmesh_repair_errors_total").increment(errors as u64);
    }

    histogram!("blobmesh_repair_cycle_duration_seconds").record(duration.as_secs_f64());
}

/// Record one blob transfer ("pull" or "push").
pub fn record_repair_transfer(peer: &str, direction: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "blobmesh_repair_transfers_total",
        "peer" => peer.to_string(),
        "direction" => direction.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record repair work skipped.
pub fn record_repair_skipped(reason: &str) {
    counter!("blobmesh_repair_skipped_total", "reason" => reason.to_string()).increment(1);
}

// =============================================================================
// Node
// =============================================================================

/// Gauge for node state.
pub fn set_node_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Running" => 1.0,
        "ShuttingDown" => 2.0,
        "Stopped" => 3.0,
        "Failed" => 4.0,
        _ => -1.0,
    };
    gauge!("blobmesh_node_state").set(value);
}

/// Record errors by type.
pub fn record_error(peer: &str, error_type: &str) {
    counter!("blobmesh_errors_total", "peer" => peer.to_string(), "error_type" => error_type.to_string()).increment(1);
}
