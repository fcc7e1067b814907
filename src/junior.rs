// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Junior-side replication state: ordered replay and divergence checks.
//!
//! Each database has a replay cursor (`next_expected`). Envelopes arrive
//! at-least-once and possibly reordered; duplicates are dropped,
//! out-of-order records are buffered, and [`JuniorReplicator::offer`]
//! releases the longest in-order run for the session to apply.
//!
//! Beacons drive two checks:
//!
//! - **gap**: the senior's `last_seq` is ahead of everything we have or
//!   have buffered — request the missing range (or a full archive).
//! - **divergence**: the beacon's checksum sample anchors at a sequence
//!   we have fully applied and the checksums differ — our replica can no
//!   longer be trusted, request a full resync.

use crate::message::UpdateMessage;
use crate::metrics;
use crate::wire::{BeaconDbStatus, ReplicationEnvelope};
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Bound on buffered out-of-order records per database before the junior
/// gives up on reordering and asks for a catch-up instead.
const MAX_PENDING_RECORDS: usize = 1024;

/// What the coordinator should do after feeding the replicator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JuniorAction {
    /// Nothing to do.
    None,
    /// Ask the senior to re-serve from `from_sequence` (or send a full
    /// archive when `want_full`).
    CatchUp { db_index: u8, from_sequence: u64, want_full: bool },
}

struct DbCursor {
    /// Sequence of the next record to apply; `next_expected - 1` is the
    /// last applied.
    next_expected: u64,
    pending: BTreeMap<u64, UpdateMessage>,
}

impl DbCursor {
    fn last_applied(&self) -> u64 {
        self.next_expected - 1
    }

    /// Highest sequence we hold, applied or buffered.
    fn horizon(&self) -> u64 {
        self.pending
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0)
            .max(self.last_applied())
    }
}

/// Replay cursors and reorder buffers for all databases of a junior peer.
pub struct JuniorReplicator {
    cursors: Vec<DbCursor>,
}

impl JuniorReplicator {
    pub fn new(num_databases: u8) -> Self {
        Self {
            cursors: (0..num_databases)
                .map(|_| DbCursor {
                    next_expected: 1,
                    pending: BTreeMap::new(),
                })
                .collect(),
        }
    }

    /// Sequence of the last record released for application.
    pub fn last_applied(&self, db_index: u8) -> u64 {
        self.cursors
            .get(db_index as usize)
            .map(DbCursor::last_applied)
            .unwrap_or(0)
    }

    /// Feed an incoming junior-batch envelope. Returns the records that
    /// are now ready to apply, in sequence order; the cursor advances past
    /// them. Duplicates return nothing.
    pub fn offer(&mut self, envelope: &ReplicationEnvelope) -> Result<Vec<(u64, UpdateMessage)>> {
        let db_index = envelope.db_index;
        let Some(cursor) = self.cursors.get_mut(db_index as usize) else {
            return Err(Error::bad_argument(format!("no database {db_index}")));
        };
        if envelope.sequence < cursor.next_expected {
            // At-least-once delivery: already applied.
            debug!(db_index, sequence = envelope.sequence, "duplicate replay record dropped");
            return Ok(Vec::new());
        }
        let msg = envelope.decode_junior_batch()?;
        if envelope.sequence > cursor.next_expected {
            metrics::record_replay_buffered(db_index);
            cursor.pending.insert(envelope.sequence, msg);
            return Ok(Vec::new());
        }

        let mut ready = vec![(envelope.sequence, msg)];
        cursor.next_expected += 1;
        while let Some(next) = cursor.pending.remove(&cursor.next_expected) {
            ready.push((cursor.next_expected, next));
            cursor.next_expected += 1;
        }
        // Stale duplicates of what we just released.
        let next_expected = cursor.next_expected;
        cursor.pending.retain(|seq, _| *seq >= next_expected);
        Ok(ready)
    }

    /// Evaluate a beacon entry against our cursor.
    ///
    /// `current_checksum` is the database's running checksum. Returns the
    /// catch-up action to take, or an [`Error::Diverged`] when the
    /// senior's checksum sample contradicts our replica.
    pub fn observe_beacon(
        &mut self,
        status: &BeaconDbStatus,
        current_checksum: u32,
    ) -> Result<JuniorAction> {
        let db_index = status.db_index;
        let Some(cursor) = self.cursors.get_mut(db_index as usize) else {
            return Err(Error::bad_argument(format!("no database {db_index}")));
        };

        if let Some(sample) = &status.checksum {
            if sample.sequence == cursor.last_applied() && sample.checksum != current_checksum {
                metrics::record_divergence(db_index);
                return Err(Error::Diverged {
                    db_index,
                    sequence: sample.sequence,
                    local: current_checksum,
                    reported: sample.checksum,
                });
            }
        }

        if cursor.pending.len() >= MAX_PENDING_RECORDS {
            warn!(db_index, pending = cursor.pending.len(), "reorder buffer full, requesting catch-up");
            let from = cursor.next_expected;
            cursor.pending.clear();
            metrics::record_catchup_requested(db_index, false);
            return Ok(JuniorAction::CatchUp {
                db_index,
                from_sequence: from,
                want_full: false,
            });
        }

        if status.last_seq > cursor.horizon() {
            metrics::record_replay_gap(db_index);
            metrics::record_catchup_requested(db_index, false);
            debug!(
                db_index,
                senior_seq = status.last_seq,
                local_seq = cursor.last_applied(),
                "replay gap detected"
            );
            return Ok(JuniorAction::CatchUp {
                db_index,
                from_sequence: cursor.next_expected,
                want_full: false,
            });
        }
        Ok(JuniorAction::None)
    }

    /// Reset after restoring a full archive anchored at `sequence`:
    /// replay resumes from the next record, anything older in the reorder
    /// buffer is dropped, and records that became in-order are released
    /// for application.
    pub fn after_full_archive(&mut self, db_index: u8, sequence: u64) -> Vec<(u64, UpdateMessage)> {
        let Some(cursor) = self.cursors.get_mut(db_index as usize) else {
            return Vec::new();
        };
        cursor.next_expected = sequence + 1;
        cursor.pending.retain(|seq, _| *seq > sequence);
        let mut ready = Vec::new();
        while let Some(next) = cursor.pending.remove(&cursor.next_expected) {
            ready.push((cursor.next_expected, next));
            cursor.next_expected += 1;
        }
        ready
    }

    /// Drop all buffered records for a database (resync about to replace
    /// everything).
    pub fn clear_pending(&mut self, db_index: u8) {
        if let Some(cursor) = self.cursors.get_mut(db_index as usize) {
            cursor.pending.clear();
        }
    }

    /// Number of buffered out-of-order records.
    pub fn pending_count(&self, db_index: u8) -> usize {
        self.cursors
            .get(db_index as usize)
            .map(|c| c.pending.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::ChecksumAt;

    fn envelope(seq: u64) -> ReplicationEnvelope {
        ReplicationEnvelope::junior_batch(0, seq, &UpdateMessage::noop()).unwrap()
    }

    fn status(last_seq: u64, checksum: Option<ChecksumAt>) -> BeaconDbStatus {
        BeaconDbStatus {
            db_index: 0,
            last_seq,
            checksum,
        }
    }

    #[test]
    fn test_in_order_release() {
        let mut j = JuniorReplicator::new(1);
        let ready = j.offer(&envelope(1)).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].0, 1);
        assert_eq!(j.last_applied(0), 1);
    }

    #[test]
    fn test_out_of_order_buffered_then_released() {
        let mut j = JuniorReplicator::new(1);
        assert!(j.offer(&envelope(3)).unwrap().is_empty());
        assert!(j.offer(&envelope(2)).unwrap().is_empty());
        assert_eq!(j.pending_count(0), 2);

        let ready = j.offer(&envelope(1)).unwrap();
        assert_eq!(ready.iter().map(|(s, _)| *s).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(j.last_applied(0), 3);
        assert_eq!(j.pending_count(0), 0);
    }

    #[test]
    fn test_duplicates_dropped() {
        let mut j = JuniorReplicator::new(1);
        j.offer(&envelope(1)).unwrap();
        assert!(j.offer(&envelope(1)).unwrap().is_empty());
        assert_eq!(j.last_applied(0), 1);
    }

    #[test]
    fn test_beacon_gap_requests_catchup() {
        let mut j = JuniorReplicator::new(1);
        j.offer(&envelope(1)).unwrap();
        let action = j.observe_beacon(&status(5, None), 0).unwrap();
        assert_eq!(
            action,
            JuniorAction::CatchUp {
                db_index: 0,
                from_sequence: 2,
                want_full: false
            }
        );
    }

    #[test]
    fn test_beacon_no_gap_when_buffered_covers() {
        let mut j = JuniorReplicator::new(1);
        j.offer(&envelope(1)).unwrap();
        // 3 is buffered: the horizon covers the senior's last_seq, so the
        // missing 2 will arrive (or a later beacon retriggers).
        j.offer(&envelope(3)).unwrap();
        let action = j.observe_beacon(&status(3, None), 0).unwrap();
        assert_eq!(action, JuniorAction::None);
    }

    #[test]
    fn test_beacon_checksum_divergence() {
        let mut j = JuniorReplicator::new(1);
        j.offer(&envelope(1)).unwrap();
        let sample = ChecksumAt {
            sequence: 1,
            checksum: 0xdead,
        };
        let err = j.observe_beacon(&status(1, Some(sample)), 0xbeef).unwrap_err();
        assert!(matches!(err, Error::Diverged { db_index: 0, sequence: 1, .. }));
    }

    #[test]
    fn test_beacon_checksum_match_ok() {
        let mut j = JuniorReplicator::new(1);
        j.offer(&envelope(1)).unwrap();
        let sample = ChecksumAt {
            sequence: 1,
            checksum: 0xfeed,
        };
        let action = j.observe_beacon(&status(1, Some(sample)), 0xfeed).unwrap();
        assert_eq!(action, JuniorAction::None);
    }

    #[test]
    fn test_beacon_checksum_at_other_sequence_ignored() {
        let mut j = JuniorReplicator::new(1);
        j.offer(&envelope(1)).unwrap();
        // Sample anchored at sequence 5; we are at 1 — not comparable,
        // but the gap triggers a catch-up.
        let sample = ChecksumAt {
            sequence: 5,
            checksum: 0x1111,
        };
        let action = j.observe_beacon(&status(5, Some(sample)), 0x2222).unwrap();
        assert!(matches!(action, JuniorAction::CatchUp { .. }));
    }

    #[test]
    fn test_after_full_archive_resumes_cursor() {
        let mut j = JuniorReplicator::new(1);
        j.offer(&envelope(10)).unwrap(); // buffered
        j.offer(&envelope(11)).unwrap(); // buffered
        j.offer(&envelope(5)).unwrap(); // buffered, pre-archive
        let ready = j.after_full_archive(0, 9);
        // 5 is obsolete, 10 and 11 become in-order and are released.
        assert_eq!(ready.iter().map(|(s, _)| *s).collect::<Vec<_>>(), vec![10, 11]);
        assert_eq!(j.last_applied(0), 11);
        assert_eq!(j.pending_count(0), 0);
    }

    #[test]
    fn test_unknown_database_rejected() {
        let mut j = JuniorReplicator::new(1);
        let env = ReplicationEnvelope::junior_batch(7, 1, &UpdateMessage::noop()).unwrap();
        assert!(j.offer(&env).is_err());
    }
}
