//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Peer membership and senior election
//! - Heartbeat / beacon traffic
//! - Update application (senior and junior sides)
//! - Replay gaps, catch-ups, and divergences
//! - Replay-log memory usage
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `treemesh_` and follow Prometheus
//! conventions: counters end in `_total`, gauges represent current state,
//! histograms track distributions.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a heartbeat sent by the local peer.
pub fn record_heartbeat_sent() {
    counter!("treemesh_heartbeats_sent_total").increment(1);
}

/// Record a heartbeat received from a peer.
pub fn record_heartbeat_received(peer_id: &str) {
    counter!("treemesh_heartbeats_received_total", "peer_id" => peer_id.to_string()).increment(1);
}

/// Record a beacon sent (senior only).
pub fn record_beacon_sent() {
    counter!("treemesh_beacons_sent_total").increment(1);
}

/// Set the number of currently attached peers.
pub fn set_attached_peers(count: usize) {
    gauge!("treemesh_attached_peers").set(count as f64);
}

/// Record a senior election outcome on this peer.
pub fn record_election(became_senior: bool) {
    let role = if became_senior { "senior" } else { "junior" };
    counter!("treemesh_elections_total", "role" => role).increment(1);
}

/// Record an update batch applied.
pub fn record_batch_applied(db_index: u8, role: &'static str) {
    counter!("treemesh_batches_applied_total", "db" => db_index.to_string(), "role" => role)
        .increment(1);
}

/// Record the duration of one senior or junior apply.
pub fn record_apply_duration(db_index: u8, duration: Duration) {
    histogram!("treemesh_apply_duration_seconds", "db" => db_index.to_string())
        .record(duration.as_secs_f64());
}

/// Record a replay gap detected by a junior.
pub fn record_replay_gap(db_index: u8) {
    counter!("treemesh_replay_gaps_total", "db" => db_index.to_string()).increment(1);
}

/// Record an out-of-order replay record buffered by a junior.
pub fn record_replay_buffered(db_index: u8) {
    counter!("treemesh_replay_buffered_total", "db" => db_index.to_string()).increment(1);
}

/// Record a catch-up request issued (gap or join).
pub fn record_catchup_requested(db_index: u8, full: bool) {
    let kind = if full { "full" } else { "log" };
    counter!("treemesh_catchups_total", "db" => db_index.to_string(), "kind" => kind).increment(1);
}

/// Record a checksum divergence detected by a junior.
pub fn record_divergence(db_index: u8) {
    counter!("treemesh_divergences_total", "db" => db_index.to_string()).increment(1);
}

/// Set the current replay-log size for a database (senior only).
pub fn set_update_log_bytes(db_index: u8, bytes: u64) {
    gauge!("treemesh_update_log_bytes", "db" => db_index.to_string()).set(bytes as f64);
}

/// Record a replay-log eviction forced by the byte budget.
pub fn record_update_log_eviction(db_index: u8) {
    counter!("treemesh_update_log_evictions_total", "db" => db_index.to_string()).increment(1);
}

/// Record a full archive served to a catching-up junior.
pub fn record_archive_served(db_index: u8, bytes: usize) {
    counter!("treemesh_archives_served_total", "db" => db_index.to_string()).increment(1);
    histogram!("treemesh_archive_bytes", "db" => db_index.to_string()).record(bytes as f64);
}

/// Set the engine lifecycle state (1.0 for the current state label).
pub fn set_engine_state(state: &str) {
    gauge!("treemesh_engine_state", "state" => state.to_string()).set(1.0);
}

/// Record a client command rejected before dispatch.
pub fn record_command_rejected(reason: &'static str) {
    counter!("treemesh_commands_rejected_total", "reason" => reason).increment(1);
}

/// Record a discovery advertisement observed.
pub fn record_advertisement(system_name: &str) {
    counter!("treemesh_advertisements_total", "system" => system_name.to_string()).increment(1);
}
