// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Peer identity, membership state, and senior election.
//!
//! Membership is derived entirely from heartbeats: a peer that is heard
//! is alive, a peer silent for `max_missing_heartbeats` periods is
//! declared offline and dropped from election. Peers in their passive
//! startup phase do not send heartbeats at all, so every heartbeat sender
//! is, by definition, attached.
//!
//! # Election
//!
//! The senior is the attached `Full` peer with the lowest [`PeerId`].
//! Election is deterministic — every peer evaluating the same membership
//! table picks the same senior, so no ballot exchange is needed. It is
//! re-evaluated whenever membership changes (a peer appears, goes
//! offline, or is blocked). `JuniorOnly` peers never win.

use crate::config::PeerType;
use crate::payload::Payload;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Globally unique peer identifier: a hardware-derived device word plus a
/// per-process nonce. Ordering is the election order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId {
    pub device: u64,
    pub nonce: u64,
}

impl PeerId {
    /// Generate an id for this process: the device word hashes the host
    /// name and process id (a MAC-address stand-in that stays stable per
    /// process), the nonce is random.
    pub fn generate() -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let mut hasher = DefaultHasher::new();
        std::env::var("HOSTNAME").unwrap_or_default().hash(&mut hasher);
        std::process::id().hash(&mut hasher);
        PeerId {
            device: hasher.finish(),
            nonce: rand::random(),
        }
    }

    /// Parse the `device:nonce` hex form produced by `Display`.
    pub fn parse(s: &str) -> Option<Self> {
        let (device, nonce) = s.split_once(':')?;
        Some(PeerId {
            device: u64::from_str_radix(device, 16).ok()?,
            nonce: u64::from_str_radix(nonce, 16).ok()?,
        })
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}:{:016x}", self.device, self.nonce)
    }
}

/// Attachment state of a known peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerState {
    /// Listening passively; not yet announcing itself.
    Startup,
    /// Fully attached and replicating.
    Attached,
    /// Attached and currently the elected senior.
    Senior,
    /// Declared offline after missed heartbeats.
    Offline,
}

/// Everything known about one peer.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub peer_type: PeerType,
    pub state: PeerState,
    /// Descriptive attributes gossiped in heartbeats.
    pub attributes: Option<Payload>,
    /// Monotonic time of the last heartbeat heard.
    pub last_heartbeat: Instant,
    /// Heartbeat packet counter of the last heartbeat heard.
    pub last_heartbeat_seq: u64,
    /// The sender's own opinion of who the senior is.
    pub senior_opinion: Option<PeerId>,
}

/// The effect an observation had on membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipChange {
    /// Nothing structural changed.
    None,
    /// A peer appeared or came back online.
    PeerJoined(PeerId),
    /// A peer went offline.
    PeerLost(PeerId),
}

/// Heartbeat-derived membership state and senior election.
pub struct MembershipTable {
    local_id: PeerId,
    offline_timeout: Duration,
    peers: HashMap<PeerId, PeerRecord>,
    /// Peers rejected for incompatible settings (e.g. a different
    /// database count under the same system name).
    blocked: HashSet<PeerId>,
}

impl MembershipTable {
    pub fn new(local_id: PeerId, offline_timeout: Duration) -> Self {
        Self {
            local_id,
            offline_timeout,
            peers: HashMap::new(),
            blocked: HashSet::new(),
        }
    }

    /// The local peer's id.
    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// Record the local peer as attached (called when the passive startup
    /// phase ends).
    pub fn attach_local(&mut self, peer_type: PeerType, attributes: Option<Payload>, now: Instant) {
        self.peers.insert(
            self.local_id,
            PeerRecord {
                peer_id: self.local_id,
                peer_type,
                state: PeerState::Attached,
                attributes,
                last_heartbeat: now,
                last_heartbeat_seq: 0,
                senior_opinion: None,
            },
        );
    }

    /// Process a heartbeat from `peer_id`.
    pub fn observe_heartbeat(
        &mut self,
        peer_id: PeerId,
        seq: u64,
        peer_type: PeerType,
        attributes: Option<Payload>,
        senior_opinion: Option<PeerId>,
        now: Instant,
    ) -> MembershipChange {
        if self.blocked.contains(&peer_id) {
            return MembershipChange::None;
        }
        match self.peers.get_mut(&peer_id) {
            Some(record) if record.state != PeerState::Offline => {
                record.last_heartbeat = now;
                record.last_heartbeat_seq = seq;
                record.peer_type = peer_type;
                record.attributes = attributes;
                record.senior_opinion = senior_opinion;
                MembershipChange::None
            }
            _ => {
                info!(peer = %peer_id, %peer_type, "peer attached");
                self.peers.insert(
                    peer_id,
                    PeerRecord {
                        peer_id,
                        peer_type,
                        state: PeerState::Attached,
                        attributes,
                        last_heartbeat: now,
                        last_heartbeat_seq: seq,
                        senior_opinion,
                    },
                );
                MembershipChange::PeerJoined(peer_id)
            }
        }
    }

    /// Declare peers silent for longer than the offline timeout offline.
    /// The local record never times out (we heard from ourselves).
    pub fn sweep_offline(&mut self, now: Instant) -> Vec<PeerId> {
        let mut lost = Vec::new();
        for record in self.peers.values_mut() {
            if record.peer_id == self.local_id || record.state == PeerState::Offline {
                continue;
            }
            if now.duration_since(record.last_heartbeat) > self.offline_timeout {
                warn!(peer = %record.peer_id, "peer offline: missed heartbeats");
                record.state = PeerState::Offline;
                lost.push(record.peer_id);
            }
        }
        lost
    }

    /// Block a peer for incompatible settings; it is removed from
    /// membership and ignored from now on.
    pub fn block(&mut self, peer_id: PeerId, reason: &str) {
        if self.blocked.insert(peer_id) {
            warn!(peer = %peer_id, reason, "peer rejected");
            self.peers.remove(&peer_id);
        }
    }

    /// True if the peer has been blocked.
    pub fn is_blocked(&self, peer_id: &PeerId) -> bool {
        self.blocked.contains(peer_id)
    }

    /// Elect the senior: the attached `Full` peer with the lowest id.
    /// Updates the `Senior`/`Attached` state marks and returns the winner,
    /// or `None` when no full peer is attached.
    pub fn elect_senior(&mut self) -> Option<PeerId> {
        let winner = self
            .peers
            .values()
            .filter(|r| {
                matches!(r.state, PeerState::Attached | PeerState::Senior)
                    && r.peer_type == PeerType::Full
            })
            .map(|r| r.peer_id)
            .min();
        for record in self.peers.values_mut() {
            match record.state {
                PeerState::Senior if Some(record.peer_id) != winner => {
                    record.state = PeerState::Attached;
                }
                PeerState::Attached if Some(record.peer_id) == winner => {
                    record.state = PeerState::Senior;
                }
                _ => {}
            }
        }
        winner
    }

    /// Look up a peer record.
    pub fn get(&self, peer_id: &PeerId) -> Option<&PeerRecord> {
        self.peers.get(peer_id)
    }

    /// All peers currently attached (including the senior and the local
    /// peer).
    pub fn attached(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers
            .values()
            .filter(|r| matches!(r.state, PeerState::Attached | PeerState::Senior))
    }

    /// Count of attached peers by type: `(full, junior_only)`.
    pub fn attached_counts(&self) -> (usize, usize) {
        self.attached().fold((0, 0), |(full, junior), r| match r.peer_type {
            PeerType::Full => (full + 1, junior),
            PeerType::JuniorOnly => (full, junior + 1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(device: u64, nonce: u64) -> PeerId {
        PeerId { device, nonce }
    }

    fn table(local: PeerId) -> MembershipTable {
        MembershipTable::new(local, Duration::from_millis(500))
    }

    #[test]
    fn test_peer_id_ordering() {
        assert!(id(1, 0) < id(2, 0));
        assert!(id(1, 1) < id(1, 2));
        assert!(id(1, 9) < id(2, 0));
    }

    #[test]
    fn test_peer_id_display_parse_roundtrip() {
        let p = id(0xdead_beef, 42);
        let parsed = PeerId::parse(&p.to_string()).unwrap();
        assert_eq!(parsed, p);
        assert!(PeerId::parse("not-an-id").is_none());
        assert!(PeerId::parse("zz:1").is_none());
    }

    #[test]
    fn test_generate_unique() {
        assert_ne!(PeerId::generate(), PeerId::generate());
    }

    #[test]
    fn test_heartbeat_attaches_peer() {
        let now = Instant::now();
        let mut t = table(id(5, 0));
        let change = t.observe_heartbeat(id(1, 0), 1, PeerType::Full, None, None, now);
        assert_eq!(change, MembershipChange::PeerJoined(id(1, 0)));
        let change = t.observe_heartbeat(id(1, 0), 2, PeerType::Full, None, None, now);
        assert_eq!(change, MembershipChange::None);
        assert_eq!(t.attached_counts(), (1, 0));
    }

    #[test]
    fn test_sweep_offline_and_rejoin() {
        let now = Instant::now();
        let mut t = table(id(5, 0));
        t.attach_local(PeerType::Full, None, now);
        t.observe_heartbeat(id(1, 0), 1, PeerType::Full, None, None, now);

        let later = now + Duration::from_secs(1);
        let lost = t.sweep_offline(later);
        assert_eq!(lost, vec![id(1, 0)]);
        assert_eq!(t.get(&id(1, 0)).unwrap().state, PeerState::Offline);
        // Local record does not time out.
        assert_ne!(t.get(&id(5, 0)).unwrap().state, PeerState::Offline);

        // A fresh heartbeat brings it back as a join.
        let change = t.observe_heartbeat(id(1, 0), 9, PeerType::Full, None, None, later);
        assert_eq!(change, MembershipChange::PeerJoined(id(1, 0)));
    }

    #[test]
    fn test_election_lowest_full_peer() {
        let now = Instant::now();
        let mut t = table(id(5, 0));
        t.attach_local(PeerType::Full, None, now);
        t.observe_heartbeat(id(9, 0), 1, PeerType::Full, None, None, now);
        t.observe_heartbeat(id(2, 0), 1, PeerType::Full, None, None, now);

        assert_eq!(t.elect_senior(), Some(id(2, 0)));
        assert_eq!(t.get(&id(2, 0)).unwrap().state, PeerState::Senior);
        assert_eq!(t.get(&id(9, 0)).unwrap().state, PeerState::Attached);

        // Senior goes offline: election moves to the next lowest.
        t.sweep_offline(now + Duration::from_secs(2));
        t.observe_heartbeat(id(9, 0), 2, PeerType::Full, None, None, now + Duration::from_secs(2));
        // (9,0) re-attached above; local (5,0) is still attached.
        assert_eq!(t.elect_senior(), Some(id(5, 0)));
        assert_eq!(t.get(&id(5, 0)).unwrap().state, PeerState::Senior);
    }

    #[test]
    fn test_junior_only_never_senior() {
        let now = Instant::now();
        let mut t = table(id(5, 0));
        t.attach_local(PeerType::JuniorOnly, None, now);
        t.observe_heartbeat(id(1, 0), 1, PeerType::JuniorOnly, None, None, now);
        assert_eq!(t.elect_senior(), None);

        t.observe_heartbeat(id(7, 0), 1, PeerType::Full, None, None, now);
        assert_eq!(t.elect_senior(), Some(id(7, 0)));
    }

    #[test]
    fn test_blocked_peer_ignored() {
        let now = Instant::now();
        let mut t = table(id(5, 0));
        t.observe_heartbeat(id(1, 0), 1, PeerType::Full, None, None, now);
        t.block(id(1, 0), "numDatabases mismatch");
        assert!(t.is_blocked(&id(1, 0)));
        assert!(t.get(&id(1, 0)).is_none());

        let change = t.observe_heartbeat(id(1, 0), 2, PeerType::Full, None, None, now);
        assert_eq!(change, MembershipChange::None);
        assert_eq!(t.elect_senior(), None);
    }

    #[test]
    fn test_senior_opinion_recorded() {
        let now = Instant::now();
        let mut t = table(id(5, 0));
        t.observe_heartbeat(id(1, 0), 1, PeerType::Full, None, Some(id(1, 0)), now);
        assert_eq!(t.get(&id(1, 0)).unwrap().senior_opinion, Some(id(1, 0)));
    }
}
