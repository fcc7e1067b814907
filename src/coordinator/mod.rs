// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Mesh peer coordinator.
//!
//! The coordinator owns everything a running peer is made of and drives
//! it from one event loop:
//! - the [`PeerSession`] (node store + database objects)
//! - membership and senior election
//! - the senior replay log / junior replay cursors
//! - heartbeat, beacon, and sweep timers
//! - the client command queue
//!
//! All state mutation happens on the loop task; the transport reader
//! tasks and client handles only post into bounded queues. That is the
//! whole concurrency story — there are no locks around the tree.
//!
//! # Lifecycle
//!
//! [`MeshPeer::spawn`] starts the loop and returns a [`MeshPeerHandle`].
//! The peer listens passively for the configured startup grace, attaches,
//! runs an election, and then serves as senior or junior until shutdown.
//! Repeated checksum divergence (3 within 10 s) declares the system
//! unstable: the engine fails and the health snapshot says so.

mod types;

pub use types::{EngineState, HealthSnapshot, PeerRole};

use crate::config::PeerSettings;
use crate::discovery::SystemCatalog;
use crate::error::{Error, Result};
use crate::filter::NodeFilter;
use crate::junior::{JuniorAction, JuniorReplicator};
use crate::membership::{MembershipChange, MembershipTable, PeerId};
use crate::message::{codes, TreeFlags, UpdateMessage};
use crate::metrics;
use crate::node::NodeArchive;
use crate::payload::Payload;
use crate::resilience::DivergenceWindow;
use crate::senior::SeniorReplicator;
use crate::session::PeerSession;
use crate::transport::Transport;
use crate::wire::{
    AdvertisedPeer, BeaconPacket, HeartbeatPacket, ReplicationEnvelope, SystemAdvertisement,
    WirePacket,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Most commands folded into one session batch.
const MAX_COMMAND_BATCH: usize = 32;

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    UploadNodeValue {
        path: String,
        payload: Option<Payload>,
        flags: TreeFlags,
        before: Option<String>,
        deadline: Option<Instant>,
        reply: Reply<()>,
    },
    UploadSubtree {
        path: String,
        subtree: NodeArchive,
        flags: TreeFlags,
        deadline: Option<Instant>,
        reply: Reply<()>,
    },
    DeleteNodes {
        path: String,
        filter: Option<NodeFilter>,
        flags: TreeFlags,
        deadline: Option<Instant>,
        reply: Reply<()>,
    },
    MoveIndexEntry {
        path: String,
        before: Option<String>,
        filter: Option<NodeFilter>,
        flags: TreeFlags,
        deadline: Option<Instant>,
        reply: Reply<()>,
    },
    UndoRedo {
        what: u32,
        pattern: String,
        reply: Reply<()>,
    },
    SaveArchive {
        db_index: u8,
        reply: Reply<NodeArchive>,
    },
    Checksums {
        db_index: u8,
        reply: Reply<(u32, u32)>,
    },
}

/// A running mesh peer.
pub struct MeshPeer;

impl MeshPeer {
    /// Build the peer state and spawn its event loop. Must be called
    /// inside a tokio runtime.
    pub fn spawn(settings: PeerSettings, transport: Arc<dyn Transport>) -> Result<MeshPeerHandle> {
        settings.validate()?;
        let local_id = PeerId::generate();
        let session = PeerSession::new(settings.clone())?;
        let membership = MembershipTable::new(local_id, settings.offline_timeout());
        let senior_rep = SeniorReplicator::new(
            settings.num_databases,
            settings.checksum_interval(),
            |db| settings.update_log_budget(db),
        );
        let junior_rep = JuniorReplicator::new(settings.num_databases);

        let (command_tx, command_rx) = mpsc::channel(256);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (health_tx, health_rx) = watch::channel(HealthSnapshot::created(settings.num_databases));

        let default_timeout = settings.command_timeout_duration();
        let core = PeerCore {
            settings,
            session,
            membership,
            senior_rep,
            junior_rep,
            transport,
            local_id,
            role: PeerRole::Startup,
            current_senior: None,
            heartbeat_seq: 0,
            divergence: DivergenceWindow::standard(),
            state: EngineState::Running,
            unstable: false,
            synced: false,
            health_tx,
        };
        let join = tokio::spawn(core.run(command_rx, shutdown_rx));

        info!(peer = %local_id, "mesh peer spawned");
        Ok(MeshPeerHandle {
            local_id,
            command_tx,
            health_rx,
            shutdown_tx,
            join,
            default_timeout,
        })
    }
}

/// Handle to a spawned peer.
pub struct MeshPeerHandle {
    local_id: PeerId,
    command_tx: mpsc::Sender<Command>,
    health_rx: watch::Receiver<HealthSnapshot>,
    shutdown_tx: watch::Sender<bool>,
    join: tokio::task::JoinHandle<()>,
    default_timeout: Duration,
}

impl MeshPeerHandle {
    /// The local peer's id.
    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// A cloneable client for submitting commands.
    pub fn client(&self) -> MeshClient {
        MeshClient {
            command_tx: self.command_tx.clone(),
            default_timeout: self.default_timeout,
        }
    }

    /// The latest health snapshot.
    pub fn health(&self) -> HealthSnapshot {
        self.health_rx.borrow().clone()
    }

    /// Watch health snapshots.
    pub fn health_receiver(&self) -> watch::Receiver<HealthSnapshot> {
        self.health_rx.clone()
    }

    /// Wait until the health snapshot satisfies `predicate`, or time
    /// out.
    pub async fn wait_for(
        &self,
        predicate: impl Fn(&HealthSnapshot) -> bool,
        timeout: Duration,
    ) -> Result<HealthSnapshot> {
        let mut rx = self.health_rx.clone();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let snap = rx.borrow_and_update();
                if predicate(&snap) {
                    return Ok(snap.clone());
                }
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(Error::Shutdown);
                    }
                }
                _ = tokio::time::sleep_until(deadline) => return Err(Error::TimedOut),
            }
        }
    }

    /// Stop the peer and wait for the loop to drain.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.join.await;
    }
}

/// Cloneable client handle for submitting commands to a peer.
#[derive(Clone)]
pub struct MeshClient {
    command_tx: mpsc::Sender<Command>,
    default_timeout: Duration,
}

impl MeshClient {
    fn deadline(&self) -> Option<Instant> {
        Some(Instant::now() + self.default_timeout)
    }

    async fn submit<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(build(tx))
            .await
            .map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)?
    }

    /// Set (or with a `None` payload remove) a node value.
    pub async fn upload_node_value(
        &self,
        path: impl Into<String>,
        payload: Option<Payload>,
        flags: TreeFlags,
        before: Option<String>,
    ) -> Result<()> {
        let path = path.into();
        let deadline = self.deadline();
        self.submit(|reply| Command::UploadNodeValue {
            path,
            payload,
            flags,
            before,
            deadline,
            reply,
        })
        .await
    }

    /// Replace a whole subtree from an archive.
    pub async fn upload_node_subtree(
        &self,
        path: impl Into<String>,
        subtree: NodeArchive,
        flags: TreeFlags,
    ) -> Result<()> {
        let path = path.into();
        let deadline = self.deadline();
        self.submit(|reply| Command::UploadSubtree {
            path,
            subtree,
            flags,
            deadline,
            reply,
        })
        .await
    }

    /// Filtered recursive delete.
    pub async fn request_delete_nodes(
        &self,
        path: impl Into<String>,
        filter: Option<NodeFilter>,
        flags: TreeFlags,
    ) -> Result<()> {
        let path = path.into();
        let deadline = self.deadline();
        self.submit(|reply| Command::DeleteNodes {
            path,
            filter,
            flags,
            deadline,
            reply,
        })
        .await
    }

    /// Filtered index reorder.
    pub async fn request_move_index_entry(
        &self,
        path: impl Into<String>,
        before: Option<String>,
        filter: Option<NodeFilter>,
        flags: TreeFlags,
    ) -> Result<()> {
        let path = path.into();
        let deadline = self.deadline();
        self.submit(|reply| Command::MoveIndexEntry {
            path,
            before,
            filter,
            flags,
            deadline,
            reply,
        })
        .await
    }

    /// Request an undo of the most recent operation matching `pattern`.
    pub async fn request_undo(&self, pattern: impl Into<String>) -> Result<()> {
        let pattern = pattern.into();
        self.submit(|reply| Command::UndoRedo {
            what: codes::REQUEST_UNDO,
            pattern,
            reply,
        })
        .await
    }

    /// Request a redo of the most recently undone operation matching
    /// `pattern`.
    pub async fn request_redo(&self, pattern: impl Into<String>) -> Result<()> {
        let pattern = pattern.into();
        self.submit(|reply| Command::UndoRedo {
            what: codes::REQUEST_REDO,
            pattern,
            reply,
        })
        .await
    }

    /// Snapshot one database as an archive.
    pub async fn save_archive(&self, db_index: u8) -> Result<NodeArchive> {
        self.submit(|reply| Command::SaveArchive { db_index, reply }).await
    }

    /// Fetch `(running, recomputed)` checksums for one database.
    pub async fn checksums(&self, db_index: u8) -> Result<(u32, u32)> {
        self.submit(|reply| Command::Checksums { db_index, reply }).await
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Event loop
// ═══════════════════════════════════════════════════════════════════════

struct PeerCore {
    settings: PeerSettings,
    session: PeerSession,
    membership: MembershipTable,
    senior_rep: SeniorReplicator,
    junior_rep: JuniorReplicator,
    transport: Arc<dyn Transport>,
    local_id: PeerId,
    role: PeerRole,
    current_senior: Option<PeerId>,
    heartbeat_seq: u64,
    divergence: DivergenceWindow,
    state: EngineState,
    unstable: bool,
    /// True once this peer's databases reflect the system state (fresh
    /// system, or a full archive restored). Gates senior takeover.
    synced: bool,
    health_tx: watch::Sender<HealthSnapshot>,
}

impl PeerCore {
    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<Command>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        metrics::set_engine_state("Running");
        let started_at = Instant::now();
        let transport = Arc::clone(&self.transport);
        let mut heartbeat_timer = tokio::time::interval(self.settings.heartbeat_interval());
        let mut beacon_timer = tokio::time::interval(self.settings.beacon_interval());
        let mut advert_timer = tokio::time::interval(Duration::from_secs(1));
        self.publish_health();

        loop {
            if self.unstable {
                self.state = EngineState::Failed;
                metrics::set_engine_state("Failed");
                self.publish_health();
                error!("system unstable: repeated divergence, stopping");
                break;
            }
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = heartbeat_timer.tick() => {
                    self.on_heartbeat_tick(started_at).await;
                }
                _ = beacon_timer.tick() => {
                    self.on_beacon_tick().await;
                }
                _ = advert_timer.tick() => {
                    self.on_advert_tick().await;
                }
                packet = transport.recv() => {
                    match packet {
                        Ok(Some(packet)) => self.on_packet(packet).await,
                        Ok(None) => {
                            warn!("transport closed, stopping");
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, "transport receive error");
                        }
                    }
                }
                maybe_cmd = command_rx.recv() => {
                    let Some(first) = maybe_cmd else { break };
                    let mut batch = vec![first];
                    while batch.len() < MAX_COMMAND_BATCH {
                        match command_rx.try_recv() {
                            Ok(cmd) => batch.push(cmd),
                            Err(_) => break,
                        }
                    }
                    self.process_commands(batch).await;
                }
            }
        }

        if self.state != EngineState::Failed {
            self.state = EngineState::ShuttingDown;
            metrics::set_engine_state("ShuttingDown");
            self.publish_health();
            self.state = EngineState::Stopped;
            metrics::set_engine_state("Stopped");
        }
        self.publish_health();
        info!(peer = %self.local_id, state = %self.state, "mesh peer stopped");
    }

    // ───────────────────────────────────────────────────────────────────
    // Timers
    // ───────────────────────────────────────────────────────────────────

    async fn on_heartbeat_tick(&mut self, started_at: Instant) {
        let now = Instant::now();
        if self.role == PeerRole::Startup {
            // Passive phase: listen only, then attach.
            if now.duration_since(started_at) >= self.settings.startup_grace() {
                self.finish_startup(now).await;
            }
            return;
        }

        self.heartbeat_seq += 1;
        let heartbeat = HeartbeatPacket::new(
            self.local_id,
            self.heartbeat_seq,
            self.settings.peer_type,
            self.settings.peer_attributes.as_ref(),
            self.current_senior,
        );
        match heartbeat {
            Ok(hb) => {
                if let Err(e) = self.transport.send(WirePacket::Heartbeat(hb)).await {
                    warn!(error = %e, "heartbeat send failed");
                } else {
                    metrics::record_heartbeat_sent();
                }
            }
            Err(e) => error!(error = %e, "heartbeat build failed (attributes too large?)"),
        }

        let lost = self.membership.sweep_offline(now);
        if !lost.is_empty() {
            self.election_check().await;
        }
    }

    async fn on_beacon_tick(&mut self) {
        if self.role != PeerRole::Senior {
            return;
        }
        let checksums: Vec<u32> = (0..self.settings.num_databases)
            .map(|i| self.session.database(i).map(|d| d.current_checksum()).unwrap_or(0))
            .collect();
        let beacon: BeaconPacket = self.senior_rep.build_beacon(self.local_id, &checksums);
        if let Err(e) = self.transport.send(WirePacket::Beacon(beacon)).await {
            warn!(error = %e, "beacon send failed");
        } else {
            metrics::record_beacon_sent();
        }
    }

    async fn on_advert_tick(&mut self) {
        if self.role == PeerRole::Startup {
            return;
        }
        let peers: Vec<AdvertisedPeer> = self
            .membership
            .attached()
            .map(|r| AdvertisedPeer {
                peer_id: r.peer_id,
                peer_type: r.peer_type,
            })
            .collect();
        let advert = SystemAdvertisement {
            system_name: self.settings.system_name.clone(),
            num_databases: self.settings.num_databases,
            peers,
        };
        if let Err(e) = self.transport.send(WirePacket::Advertisement(advert)).await {
            debug!(error = %e, "advertisement send failed");
        }
    }

    async fn finish_startup(&mut self, now: Instant) {
        info!(peer = %self.local_id, "startup grace over, attaching");
        self.membership.attach_local(
            self.settings.peer_type,
            self.settings.peer_attributes.clone(),
            now,
        );
        self.role = PeerRole::Junior;
        self.session.notify_connection_state(true);
        self.election_check().await;
        self.publish_health();
    }

    // ───────────────────────────────────────────────────────────────────
    // Election and role changes
    // ───────────────────────────────────────────────────────────────────

    /// Another attached peer's heartbeat claimed someone else is senior.
    fn observed_existing_senior(&self) -> Option<PeerId> {
        self.membership
            .attached()
            .filter_map(|r| r.senior_opinion)
            .find(|id| *id != self.local_id)
    }

    async fn election_check(&mut self) {
        let mut winner = self.membership.elect_senior();

        // A fresh peer whose id would win the election must not take over
        // a running system with empty databases — it first syncs from the
        // incumbent, then the election result takes effect.
        if winner == Some(self.local_id) && !self.synced {
            if let Some(incumbent) = self.observed_existing_senior() {
                debug!(peer = %self.local_id, %incumbent, "deferring takeover until synced");
                winner = Some(incumbent);
            } else {
                // Nobody claims a senior exists: nothing to sync from.
                self.synced = true;
            }
        }

        if winner == self.current_senior {
            return;
        }
        info!(
            peer = %self.local_id,
            old = ?self.current_senior.map(|p| p.to_string()),
            new = ?winner.map(|p| p.to_string()),
            "senior changed"
        );
        self.current_senior = winner;
        metrics::record_election(winner == Some(self.local_id));

        if winner == Some(self.local_id) {
            self.become_senior();
        } else {
            if self.role == PeerRole::Senior {
                warn!(peer = %self.local_id, "demoted: a lower peer id attached");
            }
            self.role = PeerRole::Junior;
            if winner.is_some() {
                // New senior, new sequence stream: resync everything.
                for db in 0..self.settings.num_databases {
                    self.request_full_resync(db).await;
                }
            }
        }
        let (full, junior) = self.membership.attached_counts();
        metrics::set_attached_peers(full + junior);
        self.publish_health();
    }

    fn become_senior(&mut self) {
        info!(peer = %self.local_id, "elected senior");
        self.role = PeerRole::Senior;
        self.synced = true;
        for db in 0..self.settings.num_databases {
            // A promoted junior continues the stream where its replay
            // cursor stopped; a fresh system starts at sequence 1.
            self.senior_rep.adopt_cursor(db, self.junior_rep.last_applied(db));
        }
        self.session.mark_all_steady();
    }

    // ───────────────────────────────────────────────────────────────────
    // Packets
    // ───────────────────────────────────────────────────────────────────

    async fn on_packet(&mut self, packet: WirePacket) {
        match packet {
            WirePacket::Heartbeat(hb) => self.on_heartbeat(hb).await,
            WirePacket::Beacon(beacon) => self.on_beacon(beacon).await,
            WirePacket::Advertisement(advert) => self.on_advertisement(advert).await,
            WirePacket::Replication(envelope) => self.on_replication(envelope).await,
            WirePacket::SeniorRequest { from, db_index, message } => {
                self.on_senior_request(from, db_index, message).await;
            }
            WirePacket::CatchUpRequest { from, db_index, from_sequence, want_full } => {
                self.on_catchup_request(from, db_index, from_sequence, want_full).await;
            }
        }
    }

    async fn on_heartbeat(&mut self, hb: HeartbeatPacket) {
        if hb.peer_id == self.local_id {
            return; // our own multicast loopback
        }
        metrics::record_heartbeat_received(&hb.peer_id.to_string());
        let attributes = match hb.attributes() {
            Ok(attrs) => attrs,
            Err(e) => {
                warn!(peer = %hb.peer_id, error = %e, "undecodable heartbeat attributes");
                None
            }
        };
        let change = self.membership.observe_heartbeat(
            hb.peer_id,
            hb.seq,
            hb.peer_type,
            attributes,
            hb.senior_opinion,
            Instant::now(),
        );
        if change != MembershipChange::None && self.role != PeerRole::Startup {
            self.election_check().await;
        }
    }

    async fn on_beacon(&mut self, beacon: BeaconPacket) {
        if self.role != PeerRole::Junior || Some(beacon.peer_id) != self.current_senior {
            return;
        }
        for status in &beacon.per_db {
            let checksum = self
                .session
                .database(status.db_index)
                .map(|d| d.current_checksum())
                .unwrap_or(0);
            match self.junior_rep.observe_beacon(status, checksum) {
                Ok(JuniorAction::None) => {}
                Ok(JuniorAction::CatchUp { db_index, from_sequence, want_full }) => {
                    self.send_catchup(db_index, from_sequence, want_full).await;
                }
                Err(err) => {
                    self.handle_divergence(status.db_index, err).await;
                }
            }
        }
    }

    async fn on_advertisement(&mut self, advert: SystemAdvertisement) {
        if SystemCatalog::is_incompatible(
            &advert,
            &self.settings.system_name,
            self.settings.num_databases,
        ) {
            for peer in &advert.peers {
                self.membership.block(peer.peer_id, "numDatabases mismatch");
            }
            if self.role != PeerRole::Startup {
                self.election_check().await;
            }
        }
    }

    async fn on_replication(&mut self, envelope: ReplicationEnvelope) {
        // Seniors ignore foreign replication traffic (a stale senior may
        // still be flushing); startup peers stay passive and resync after
        // attaching instead.
        if self.role != PeerRole::Junior {
            debug!(db_index = envelope.db_index, role = %self.role, "replication envelope ignored");
            return;
        }
        let db_index = envelope.db_index;
        match envelope.kind {
            crate::wire::EnvelopeKind::JuniorBatch => {
                match self.junior_rep.offer(&envelope) {
                    Ok(ready) => self.apply_ready(db_index, ready).await,
                    Err(e) => warn!(db_index, error = %e, "bad replay envelope"),
                }
            }
            crate::wire::EnvelopeKind::FullArchive => {
                self.on_full_archive(envelope).await;
            }
            crate::wire::EnvelopeKind::ChecksumReport => {
                if envelope.sequence != self.junior_rep.last_applied(db_index) {
                    return;
                }
                let reported = match envelope.decode_checksum_report() {
                    Ok(cs) => cs,
                    Err(e) => {
                        warn!(db_index, error = %e, "bad checksum report");
                        return;
                    }
                };
                let local = self
                    .session
                    .database(db_index)
                    .map(|d| d.current_checksum())
                    .unwrap_or(0);
                if reported != local {
                    let err = Error::Diverged {
                        db_index,
                        sequence: envelope.sequence,
                        local,
                        reported,
                    };
                    metrics::record_divergence(db_index);
                    self.handle_divergence(db_index, err).await;
                }
            }
        }
    }

    async fn apply_ready(&mut self, db_index: u8, ready: Vec<(u64, UpdateMessage)>) {
        for (sequence, msg) in ready {
            let start = Instant::now();
            match self.session.junior_update(db_index, &msg) {
                Ok(()) => {
                    metrics::record_batch_applied(db_index, "junior");
                    metrics::record_apply_duration(db_index, start.elapsed());
                }
                Err(err) => {
                    error!(db_index, sequence, %err, "junior replay failed");
                    if err.wants_resync() {
                        self.request_full_resync(db_index).await;
                    }
                    break;
                }
            }
        }
        self.publish_health();
    }

    async fn on_full_archive(&mut self, envelope: ReplicationEnvelope) {
        let db_index = envelope.db_index;
        let archive = match envelope.decode_full_archive() {
            Ok(archive) => archive,
            Err(e) => {
                warn!(db_index, error = %e, "bad archive envelope");
                return;
            }
        };
        match self.session.set_from_archive(db_index, &archive) {
            Ok(()) => {
                info!(db_index, sequence = envelope.sequence, "database restored from archive");
                let ready = self.junior_rep.after_full_archive(db_index, envelope.sequence);
                self.session.notify_connection_state(true);
                self.apply_ready(db_index, ready).await;
                if !self.synced {
                    self.synced = true;
                    // A deferred takeover may apply now that we hold the
                    // system state.
                    self.election_check().await;
                }
            }
            Err(err) => error!(db_index, %err, "archive restore failed"),
        }
        self.publish_health();
    }

    async fn on_senior_request(&mut self, from: PeerId, db_index: u8, message: UpdateMessage) {
        if self.role != PeerRole::Senior {
            return;
        }
        debug!(%from, db_index, "applying forwarded client request");
        if let Err(err) = self.apply_as_senior(db_index, &message).await {
            // The requester observes the applied effect (if any) through
            // the replication stream; there is no per-request reply path.
            warn!(%from, db_index, %err, "forwarded request failed");
        }
        self.publish_health();
    }

    async fn on_catchup_request(
        &mut self,
        from: PeerId,
        db_index: u8,
        from_sequence: u64,
        want_full: bool,
    ) {
        if self.role != PeerRole::Senior || from == self.local_id {
            return;
        }
        if !want_full {
            if let Some(envelopes) = self.senior_rep.replay_from(db_index, from_sequence) {
                debug!(%from, db_index, from_sequence, count = envelopes.len(), "re-serving replay log");
                for env in envelopes {
                    if let Err(e) = self.transport.send(WirePacket::Replication(env)).await {
                        warn!(error = %e, "replay re-send failed");
                        return;
                    }
                }
                return;
            }
            // Fell off the log; full archive instead.
        }
        match self.session.save_to_archive(db_index) {
            Ok(archive) => {
                let sequence = self.senior_rep.last_seq(db_index);
                match ReplicationEnvelope::full_archive(db_index, sequence, &archive) {
                    Ok(env) => {
                        metrics::record_archive_served(db_index, env.body.len());
                        info!(%from, db_index, sequence, "serving full archive");
                        if let Err(e) = self.transport.send(WirePacket::Replication(env)).await {
                            warn!(error = %e, "archive send failed");
                        }
                    }
                    Err(e) => error!(db_index, error = %e, "archive encode failed"),
                }
            }
            Err(e) => error!(db_index, error = %e, "archive save failed"),
        }
    }

    // ───────────────────────────────────────────────────────────────────
    // Commands
    // ───────────────────────────────────────────────────────────────────

    async fn process_commands(&mut self, batch: Vec<Command>) {
        self.session.begin_command_batch();
        for command in batch {
            self.process_command(command).await;
        }
        self.session.end_command_batch();
        self.publish_health();
    }

    async fn process_command(&mut self, command: Command) {
        match command {
            Command::UploadNodeValue { path, payload, flags, before, deadline, reply } => {
                let outcome = match self.check_deadline(deadline) {
                    Err(e) => Err(e),
                    Ok(()) => match self.session.build_upload_node_value(&path, payload, flags, before) {
                        Ok((db_index, msg)) => self.route_mutation(db_index, msg).await,
                        Err(e) => {
                            metrics::record_command_rejected("no_database");
                            Err(e)
                        }
                    },
                };
                let _ = reply.send(outcome);
            }
            Command::UploadSubtree { path, subtree, flags, deadline, reply } => {
                let outcome = match self.check_deadline(deadline) {
                    Err(e) => Err(e),
                    Ok(()) => match self.session.build_upload_subtree(&path, subtree, flags) {
                        Ok((db_index, msg)) => self.route_mutation(db_index, msg).await,
                        Err(e) => Err(e),
                    },
                };
                let _ = reply.send(outcome);
            }
            Command::DeleteNodes { path, filter, flags, deadline, reply } => {
                let outcome = match self.check_deadline(deadline) {
                    Err(e) => Err(e),
                    Ok(()) => match self.session.build_delete_nodes(&path, filter, flags) {
                        Ok((db_index, msg)) => self.route_mutation(db_index, msg).await,
                        Err(e) => Err(e),
                    },
                };
                let _ = reply.send(outcome);
            }
            Command::MoveIndexEntry { path, before, filter, flags, deadline, reply } => {
                let outcome = match self.check_deadline(deadline) {
                    Err(e) => Err(e),
                    Ok(()) => match self.session.build_move_index_entry(&path, before, filter, flags) {
                        Ok((db_index, msg)) => self.route_mutation(db_index, msg).await,
                        Err(e) => Err(e),
                    },
                };
                let _ = reply.send(outcome);
            }
            Command::UndoRedo { what, pattern, reply } => {
                let msg = UpdateMessage::undo_request(what, pattern);
                let outcome = self.route_mutation(0, msg).await;
                let _ = reply.send(outcome);
            }
            Command::SaveArchive { db_index, reply } => {
                let _ = reply.send(self.session.save_to_archive(db_index));
            }
            Command::Checksums { db_index, reply } => {
                let outcome = match self.session.database(db_index) {
                    Some(db) => Ok((db.current_checksum(), self.session.calculate_checksum(db_index))),
                    None => Err(Error::bad_argument(format!("no database {db_index}"))),
                };
                let _ = reply.send(outcome);
            }
        }
    }

    fn check_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        match deadline {
            Some(d) if Instant::now() > d => {
                metrics::record_command_rejected("timeout");
                Err(Error::TimedOut)
            }
            _ => Ok(()),
        }
    }

    /// Apply locally when senior, forward to the senior when junior.
    async fn route_mutation(&mut self, db_index: u8, msg: UpdateMessage) -> Result<()> {
        match self.role {
            PeerRole::Senior => self.apply_as_senior(db_index, &msg).await,
            PeerRole::Junior => {
                if self.current_senior.is_none() {
                    metrics::record_command_rejected("no_senior");
                    return Err(Error::BadObject);
                }
                self.transport
                    .send(WirePacket::SeniorRequest {
                        from: self.local_id,
                        db_index,
                        message: msg,
                    })
                    .await
            }
            PeerRole::Startup => {
                metrics::record_command_rejected("not_attached");
                Err(Error::BadObject)
            }
        }
    }

    async fn apply_as_senior(&mut self, db_index: u8, msg: &UpdateMessage) -> Result<()> {
        let start = Instant::now();
        let (junior_msg, outcome) = self.session.senior_update(db_index, msg);
        metrics::record_batch_applied(db_index, "senior");
        metrics::record_apply_duration(db_index, start.elapsed());
        // Publish even on error: the partial record keeps juniors
        // converged with our partial state.
        let envelope = self.senior_rep.record_batch(db_index, &junior_msg)?;
        self.transport.send(WirePacket::Replication(envelope)).await?;
        outcome
    }

    // ───────────────────────────────────────────────────────────────────
    // Divergence and resync
    // ───────────────────────────────────────────────────────────────────

    async fn send_catchup(&mut self, db_index: u8, from_sequence: u64, want_full: bool) {
        let packet = WirePacket::CatchUpRequest {
            from: self.local_id,
            db_index,
            from_sequence,
            want_full,
        };
        if let Err(e) = self.transport.send(packet).await {
            warn!(db_index, error = %e, "catch-up request send failed");
        }
    }

    async fn request_full_resync(&mut self, db_index: u8) {
        self.junior_rep.clear_pending(db_index);
        metrics::record_catchup_requested(db_index, true);
        let from_sequence = self.junior_rep.last_applied(db_index) + 1;
        self.send_catchup(db_index, from_sequence, true).await;
    }

    async fn handle_divergence(&mut self, db_index: u8, err: Error) {
        error!(db_index, %err, "checksum divergence");
        self.session.notify_connection_state(false);
        if self.divergence.record(Instant::now()) {
            self.unstable = true;
            return;
        }
        self.request_full_resync(db_index).await;
    }

    // ───────────────────────────────────────────────────────────────────
    // Health
    // ───────────────────────────────────────────────────────────────────

    fn publish_health(&self) {
        let (full, junior) = self.membership.attached_counts();
        let db_checksums = (0..self.settings.num_databases)
            .map(|i| self.session.database(i).map(|d| d.current_checksum()).unwrap_or(0))
            .collect();
        let db_sequences = (0..self.settings.num_databases)
            .map(|i| match self.role {
                PeerRole::Senior => self.senior_rep.last_seq(i),
                _ => self.junior_rep.last_applied(i),
            })
            .collect();
        let _ = self.health_tx.send(HealthSnapshot {
            state: self.state,
            role: self.role,
            senior: self.current_senior,
            attached_peers: full + junior,
            db_checksums,
            db_sequences,
            synced: self.synced,
            unstable: self.unstable,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerType;
    use crate::transport::InMemoryMesh;

    fn fast_settings(name: &str) -> PeerSettings {
        let mut settings = PeerSettings::for_testing(name);
        settings.heartbeats_per_second = 50;
        settings.heartbeats_before_fully_attached = 2;
        settings.beacons_per_second = 20;
        settings
    }

    #[tokio::test]
    async fn test_lone_full_peer_becomes_senior() {
        let mesh = InMemoryMesh::new();
        let peer = MeshPeer::spawn(fast_settings("solo"), Arc::new(mesh.endpoint())).unwrap();

        let health = peer
            .wait_for(|h| h.role == PeerRole::Senior, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(health.senior, Some(peer.local_id()));
        assert!(health.ready());
        peer.shutdown().await;
    }

    #[tokio::test]
    async fn test_junior_only_peer_never_senior() {
        let mesh = InMemoryMesh::new();
        let mut settings = fast_settings("lonely-junior");
        settings.peer_type = PeerType::JuniorOnly;
        let peer = MeshPeer::spawn(settings, Arc::new(mesh.endpoint())).unwrap();

        let health = peer
            .wait_for(|h| h.role != PeerRole::Startup, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(health.role, PeerRole::Junior);
        assert_eq!(health.senior, None);
        peer.shutdown().await;
    }

    #[tokio::test]
    async fn test_senior_applies_client_command() {
        let mesh = InMemoryMesh::new();
        let mut settings = fast_settings("cmd");
        settings.database_roots = vec!["magnets".to_string()];
        let peer = MeshPeer::spawn(settings, Arc::new(mesh.endpoint())).unwrap();
        peer.wait_for(|h| h.role == PeerRole::Senior, Duration::from_secs(5))
            .await
            .unwrap();

        let client = peer.client();
        let mut payload = Payload::new();
        payload.put_str("colour", "red");
        client
            .upload_node_value("magnets/fridge", Some(payload), TreeFlags::none(), None)
            .await
            .unwrap();

        let (running, recomputed) = client.checksums(0).await.unwrap();
        assert_eq!(running, recomputed);
        assert_ne!(running, 0);

        let archive = client.save_archive(0).await.unwrap();
        assert!(archive.children.contains_key("fridge"));
        peer.shutdown().await;
    }

    #[tokio::test]
    async fn test_commands_rejected_before_attach() {
        let mesh = InMemoryMesh::new();
        let mut settings = fast_settings("early");
        settings.heartbeats_per_second = 2; // long startup grace
        settings.heartbeats_before_fully_attached = 10;
        let peer = MeshPeer::spawn(settings, Arc::new(mesh.endpoint())).unwrap();

        let client = peer.client();
        let result = client
            .upload_node_value("dbs/db_0/x", Some(Payload::new()), TreeFlags::none(), None)
            .await;
        assert!(matches!(result, Err(Error::BadObject)));
        peer.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_database_checksum_rejected() {
        let mesh = InMemoryMesh::new();
        let peer = MeshPeer::spawn(fast_settings("chk"), Arc::new(mesh.endpoint())).unwrap();
        peer.wait_for(|h| h.role == PeerRole::Senior, Duration::from_secs(5))
            .await
            .unwrap();
        let client = peer.client();
        assert!(matches!(client.checksums(9).await, Err(Error::BadArgument(_))));
        peer.shutdown().await;
    }
}
