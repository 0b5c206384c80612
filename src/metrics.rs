// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the sync engine.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host application chooses the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `replica`: replica id
//! - `direction`: push, pull
//! - `kind`: entity kind
//! - `outcome`: success, failed, cancelled

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

use crate::entity::EntityKind;

/// Record a finished sync session
pub fn record_session(replica: &str, outcome: &str) {
    counter!(
        "sync_sessions_total",
        "replica" => replica.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record session wall time
pub fn record_session_duration(replica: &str, duration: Duration) {
    histogram!(
        "sync_session_seconds",
        "replica" => replica.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record entities moved in one direction
pub fn record_entities(direction: &str, count: usize) {
    counter!(
        "sync_entities_total",
        "direction" => direction.to_string()
    )
    .increment(count as u64);
}

/// Record a conflict that went through the resolver
pub fn record_conflict(kind: EntityKind) {
    counter!(
        "sync_conflicts_total",
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Record an entity whose parent could not be resolved
pub fn record_orphan(kind: EntityKind) {
    counter!(
        "sync_orphans_total",
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Record a rejected entity
pub fn record_rejection(kind: EntityKind, reason: &str) {
    counter!(
        "sync_rejections_total",
        "kind" => kind.as_str(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Set current session state (0 = Idle .. 5 = Failed)
pub fn set_session_state(replica: &str, state: u8) {
    gauge!(
        "sync_session_state",
        "replica" => replica.to_string()
    )
    .set(state as f64);
}

/// Record a session retry after a transport failure
pub fn record_retry(replica: &str) {
    counter!(
        "sync_retries_total",
        "replica" => replica.to_string()
    )
    .increment(1);
}

/// Record a photo blob transfer
pub fn record_blob_transfer(direction: &str, success: bool, bytes: usize) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "sync_blob_transfers_total",
        "direction" => direction.to_string(),
        "status" => status
    )
    .increment(1);
    if success {
        counter!("sync_blob_bytes_total", "direction" => direction.to_string()).increment(bytes as u64);
    }
}

/// Record data corruption detection
pub fn record_corruption(hash: &str) {
    counter!(
        "sync_corruption_detected_total",
        "hash" => hash.to_string()
    )
    .increment(1);
}

/// Record phase latency
pub fn record_latency(phase: &str, duration: Duration) {
    histogram!(
        "sync_phase_seconds",
        "phase" => phase.to_string()
    )
    .record(duration.as_secs_f64());
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    phase: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(phase: &'static str) -> Self {
        Self {
            phase,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.phase, self.start.elapsed());
    }
}
