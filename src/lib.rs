//! # treemesh
//!
//! A replicated hierarchical message-tree database shared among peers on
//! a local network. Every peer holds a full copy of one or more
//! databases (trees of named nodes carrying opaque payloads); mutations
//! are linearized by an elected *senior* peer and replayed verbatim by
//! *junior* peers.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                             mesh peer                                │
//! │                                                                      │
//! │  ┌──────────┐   ┌─────────────────────────┐   ┌───────────────────┐  │
//! │  │ clients  │──▶│ PeerSession             │──▶│ TreeSubscribers   │  │
//! │  │ (queue)  │   │  NodeStore + databases  │   │ (batch flush)     │  │
//! │  └──────────┘   └───────────┬─────────────┘   └───────────────────┘  │
//! │                             │ senior: assembled junior message       │
//! │                             ▼                                        │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────────────────┐  │
//! │  │ Membership   │   │ SeniorRep    │   │ JuniorRep                │  │
//! │  │ (heartbeats, │   │ (sequences,  │   │ (ordering buffer,        │  │
//! │  │  election)   │   │  replay log) │   │  catch-up, divergence)   │  │
//! │  └──────┬───────┘   └──────┬───────┘   └────────────┬─────────────┘  │
//! │         └──────────────────┴───────────┬────────────┘                │
//! │                                        ▼                             │
//! │                            multicast transport                       │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The elected senior applies every mutation to its node store, records
//! the resulting primitives as an *assembled junior message*, and
//! broadcasts it with a per-database sequence. Juniors replay the records
//! in order; heartbeats maintain membership, beacons let juniors detect
//! gaps and checksum divergence, and catch-up transfers (replay-log
//! re-serves or full archives) repair both.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use treemesh::{MeshPeer, PeerSettings, Payload, TreeFlags};
//! use treemesh::transport::UdpMulticastTransport;
//!
//! #[tokio::main]
//! async fn main() -> treemesh::Result<()> {
//!     let settings = PeerSettings {
//!         system_name: "fridge".into(),
//!         ..Default::default()
//!     };
//!     let transport = UdpMulticastTransport::bind(&settings.system_name, false).await?;
//!     let peer = MeshPeer::spawn(settings, Arc::new(transport))?;
//!
//!     let client = peer.client();
//!     let mut magnet = Payload::new();
//!     magnet.put_str("colour", "red");
//!     client
//!         .upload_node_value("dbs/db_0/magnets/", Some(magnet), TreeFlags::INDEXED, None)
//!         .await?;
//!     peer.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod config;
pub mod coordinator;
pub mod database;
pub mod discovery;
pub mod error;
pub mod filter;
pub mod junior;
pub mod membership;
pub mod message;
pub mod metrics;
pub mod node;
pub mod path;
pub mod payload;
pub mod resilience;
pub mod senior;
pub mod session;
pub mod transport;
pub mod wire;

// Re-exports for convenience
pub use config::{PeerSettings, PeerType};
pub use coordinator::{EngineState, HealthSnapshot, MeshClient, MeshPeer, MeshPeerHandle, PeerRole};
pub use database::{DbState, TreeDatabase};
pub use discovery::{SystemCatalog, SystemSummary};
pub use error::{Error, Result};
pub use filter::NodeFilter;
pub use membership::{MembershipTable, PeerId};
pub use message::{TreeFlags, UpdateMessage};
pub use node::{DataNode, NodeArchive, NodeStore};
pub use payload::Payload;
pub use session::{PeerSession, TreeSubscriber};
