// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Senior-side replication state: sequencing and the replay log.
//!
//! For every database the senior assigns a monotonic sequence to each
//! command batch and keeps the recent batches in a RAM-bounded replay log.
//! A junior that missed a few sequences gets them re-served from the log;
//! one that fell behind the log's byte budget gets a full archive instead.
//!
//! ```text
//! batch ──seq──▶ ReplicationEnvelope ──▶ broadcast
//!                       │
//!                  replay log (≤ budget bytes, oldest evicted)
//!                       │
//!            re-served on CatchUpRequest
//! ```
//!
//! The replay log never creates gaps: sequences are assigned exactly once
//! and eviction only trims the old end.

use crate::error::Result;
use crate::message::UpdateMessage;
use crate::metrics;
use crate::wire::{BeaconDbStatus, BeaconPacket, ChecksumAt, ReplicationEnvelope};
use crate::membership::PeerId;
use std::collections::VecDeque;
use tracing::debug;

struct DbReplayLog {
    /// Sequence the next batch will get. The first batch of a fresh
    /// database is sequence 1; 0 means "nothing published yet".
    next_seq: u64,
    log: VecDeque<ReplicationEnvelope>,
    log_bytes: u64,
    budget: u64,
    batches_since_checksum: u32,
}

impl DbReplayLog {
    fn oldest_seq(&self) -> Option<u64> {
        self.log.front().map(|e| e.sequence)
    }
}

/// Sequencing and replay-log state for all databases of a senior peer.
pub struct SeniorReplicator {
    logs: Vec<DbReplayLog>,
    checksum_interval: u32,
}

impl SeniorReplicator {
    /// Create replicator state; `budget(db)` is the per-database replay
    /// log byte budget.
    pub fn new(num_databases: u8, checksum_interval: u32, budget: impl Fn(u8) -> u64) -> Self {
        Self {
            logs: (0..num_databases)
                .map(|i| DbReplayLog {
                    next_seq: 1,
                    log: VecDeque::new(),
                    log_bytes: 0,
                    budget: budget(i),
                    batches_since_checksum: 0,
                })
                .collect(),
            checksum_interval: checksum_interval.max(1),
        }
    }

    /// Continue sequencing from an already-applied cursor. Used when a
    /// junior is promoted to senior mid-life: its databases are at
    /// `last_applied`, and the new stream must carry on from there.
    pub fn adopt_cursor(&mut self, db_index: u8, last_applied: u64) {
        if let Some(log) = self.logs.get_mut(db_index as usize) {
            log.next_seq = last_applied + 1;
            log.log.clear();
            log.log_bytes = 0;
            log.batches_since_checksum = 0;
        }
    }

    /// Sequence of the last published batch (0 when none).
    pub fn last_seq(&self, db_index: u8) -> u64 {
        self.logs
            .get(db_index as usize)
            .map(|l| l.next_seq - 1)
            .unwrap_or(0)
    }

    /// Assign the next sequence to a junior replay record, append it to
    /// the replay log, and return the envelope to broadcast.
    pub fn record_batch(&mut self, db_index: u8, msg: &UpdateMessage) -> Result<ReplicationEnvelope> {
        let log = &mut self.logs[db_index as usize];
        let sequence = log.next_seq;
        log.next_seq += 1;
        log.batches_since_checksum += 1;

        let envelope = ReplicationEnvelope::junior_batch(db_index, sequence, msg)?;
        log.log_bytes += envelope.body.len() as u64;
        log.log.push_back(envelope.clone());
        while log.log_bytes > log.budget && log.log.len() > 1 {
            if let Some(evicted) = log.log.pop_front() {
                log.log_bytes -= evicted.body.len() as u64;
                metrics::record_update_log_eviction(db_index);
                debug!(db_index, sequence = evicted.sequence, "replay log evicted oldest batch");
            }
        }
        metrics::set_update_log_bytes(db_index, log.log_bytes);
        Ok(envelope)
    }

    /// Checksum sample for the beacon, when one is due (every
    /// `checksum_interval` batches).
    pub fn checksum_sample(&mut self, db_index: u8, current_checksum: u32) -> Option<ChecksumAt> {
        let log = &mut self.logs[db_index as usize];
        if log.batches_since_checksum < self.checksum_interval {
            return None;
        }
        log.batches_since_checksum = 0;
        Some(ChecksumAt {
            sequence: log.next_seq - 1,
            checksum: current_checksum,
        })
    }

    /// Build a beacon for all databases. `checksums[i]` is database `i`'s
    /// current running checksum; a sample is attached for databases whose
    /// interval elapsed.
    pub fn build_beacon(&mut self, peer_id: PeerId, checksums: &[u32]) -> BeaconPacket {
        let per_db = (0..self.logs.len())
            .map(|i| {
                let db_index = i as u8;
                BeaconDbStatus {
                    db_index,
                    last_seq: self.last_seq(db_index),
                    checksum: checksums
                        .get(i)
                        .and_then(|cs| self.checksum_sample(db_index, *cs)),
                }
            })
            .collect();
        BeaconPacket { peer_id, per_db }
    }

    /// Re-serve logged batches starting at `from_sequence`. Returns `None`
    /// when the log no longer reaches back that far — the junior needs a
    /// full archive.
    pub fn replay_from(&self, db_index: u8, from_sequence: u64) -> Option<Vec<ReplicationEnvelope>> {
        let log = self.logs.get(db_index as usize)?;
        if from_sequence >= log.next_seq {
            // Nothing newer than that exists; an empty replay is valid.
            return Some(Vec::new());
        }
        match log.oldest_seq() {
            Some(oldest) if from_sequence >= oldest => Some(
                log.log
                    .iter()
                    .filter(|e| e.sequence >= from_sequence)
                    .cloned()
                    .collect(),
            ),
            // Log empty or trimmed past the request.
            _ => None,
        }
    }

    /// Current replay-log size in bytes.
    pub fn log_bytes(&self, db_index: u8) -> u64 {
        self.logs.get(db_index as usize).map(|l| l.log_bytes).unwrap_or(0)
    }
}
