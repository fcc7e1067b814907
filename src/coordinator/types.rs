//! Engine lifecycle types.
//!
//! # State Transitions
//!
//! ```text
//!                 start()
//! Created ──────────────────→ Running ──────────────→ ShuttingDown
//!                                │        shutdown()        │
//!                                │ (unstable system)         ↓
//!                                └────────→ Failed        Stopped
//! ```
//!
//! While `Running`, the peer moves through the replication roles:
//! `Startup` (passive listening) → `Junior` (replaying) and possibly
//! `Senior` (elected coordinator). Role changes do not change the engine
//! state — a peer is `Running` whether it leads or follows.

use crate::membership::PeerId;

/// Lifecycle state of a mesh peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Built but not started.
    Created,
    /// Event loop running (any role).
    Running,
    /// Draining and leaving the system.
    ShuttingDown,
    /// Clean shutdown complete.
    Stopped,
    /// Unrecoverable: repeated divergence declared the system unstable.
    Failed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Failed => write!(f, "Failed"),
        }
    }
}

/// Replication role while running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// Listening passively before announcing attachment.
    Startup,
    /// Attached, replaying the senior's updates.
    Junior,
    /// Elected coordinator, linearizing mutations.
    Senior,
}

impl std::fmt::Display for PeerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerRole::Startup => write!(f, "Startup"),
            PeerRole::Junior => write!(f, "Junior"),
            PeerRole::Senior => write!(f, "Senior"),
        }
    }
}

/// Point-in-time health of a running peer, published on a watch channel.
///
/// Collected without network I/O; cheap to read at any rate.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthSnapshot {
    pub state: EngineState,
    pub role: PeerRole,
    /// The peer this node currently believes is senior.
    pub senior: Option<PeerId>,
    /// Attached peers, local included.
    pub attached_peers: usize,
    /// Per-database running checksums.
    pub db_checksums: Vec<u32>,
    /// Per-database last applied (junior) or published (senior) sequence.
    pub db_sequences: Vec<u64>,
    /// True once the databases reflect the system state (fresh system or
    /// a full archive restored).
    pub synced: bool,
    /// Set when repeated divergence declared the system unstable.
    pub unstable: bool,
}

impl HealthSnapshot {
    /// A freshly created, not-yet-started peer.
    pub fn created(num_databases: u8) -> Self {
        Self {
            state: EngineState::Created,
            role: PeerRole::Startup,
            senior: None,
            attached_peers: 0,
            db_checksums: vec![0; num_databases as usize],
            db_sequences: vec![0; num_databases as usize],
            synced: false,
            unstable: false,
        }
    }

    /// Ready to serve: running and out of the passive startup phase.
    pub fn ready(&self) -> bool {
        self.state == EngineState::Running && self.role != PeerRole::Startup
    }
}
