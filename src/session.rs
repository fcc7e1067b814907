// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Peer session: node store, database objects, and subscriber fanout.
//!
//! The session is the single-threaded heart of a peer. It owns the
//! [`NodeStore`], the per-database [`TreeDatabase`] objects, the explicit
//! update-context stack, and the subscriber list. Every mutation — a
//! client command applied as senior, a replay record applied as junior, an
//! archive restore — flows through here, on one task, in order.
//!
//! # Command flow
//!
//! ```text
//! client path ──route()──▶ (db_index, db-relative subpath)
//!                               │
//!            senior_update() / junior_update()
//!                               │
//!                    NodeStore mutation ──▶ NodeEvents
//!                               │
//!              dispatch: databases (checksum + junior assembly)
//!                        pending queue (subscribers, flushed per batch)
//! ```
//!
//! Routing tries each database in index order and delivers to the first
//! match; commands matching no database are rejected with `BadArgument`.
//!
//! # Batching
//!
//! A command batch brackets any number of updates. Subscriber
//! notifications are buffered while the batch nest count is non-zero and
//! flushed exactly once when the outermost bracket exits — reentrant
//! updates (e.g. from filter evaluation) therefore see consistent state
//! and subscribers see one coherent wave per batch.

use crate::config::PeerSettings;
use crate::database::{Subpath, TreeDatabase, UpdateContext};
use crate::error::{Error, Result};
use crate::filter::NodeFilter;
use crate::message::{codes, code_name, is_senior_only, TreeFlags, UpdateMessage};
use crate::node::{DataNode, IndexOp, NodeArchive, NodeEvent, NodeStore, StoreFlags};
use crate::payload::Payload;
use crate::path::segments;
use tracing::{debug, error, info};

/// Receives node-change notifications for a subscribed path pattern.
///
/// Callbacks run at batch-flush time on the session task; they must not
/// block.
pub trait TreeSubscriber: Send {
    /// A node matching the subscription was created, changed, or removed.
    fn on_node_updated(&mut self, path: &str, payload: Option<&Payload>, removed: bool);

    /// The ordered index of a node matching the subscription changed.
    fn on_node_index_changed(&mut self, path: &str, op: IndexOp, position: u32, key: &str);

    /// The peer's attachment to the system changed.
    fn on_connection_state_changed(&mut self, _attached: bool) {}
}

/// Handle for removing a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberId(u64);

/// True if `path` matches a subscription `pattern`: same depth,
/// per-segment glob.
fn subscription_matches(pattern: &str, path: &str) -> bool {
    let pat: Vec<&str> = segments(pattern).collect();
    let segs: Vec<&str> = segments(path).collect();
    pat.len() == segs.len()
        && pat
            .iter()
            .zip(segs.iter())
            .all(|(p, s)| crate::path::glob_match(p, s))
}

/// The per-peer session state.
pub struct PeerSession {
    settings: PeerSettings,
    store: NodeStore,
    databases: Vec<TreeDatabase>,
    context_stack: Vec<UpdateContext>,
    batch_nest: u32,
    pending: Vec<NodeEvent>,
    subscribers: Vec<(SubscriberId, String, Box<dyn TreeSubscriber>)>,
    next_subscriber_id: u64,
}

impl PeerSession {
    /// Build a session with one database object per configured database.
    pub fn new(settings: PeerSettings) -> Result<Self> {
        settings.validate()?;
        let databases = (0..settings.num_databases)
            .map(|i| TreeDatabase::new(i, &settings.database_root(i)))
            .collect();
        Ok(Self {
            settings,
            store: NodeStore::new(),
            databases,
            context_stack: Vec::new(),
            batch_nest: 0,
            pending: Vec::new(),
            subscribers: Vec::new(),
            next_subscriber_id: 0,
        })
    }

    /// The settings the session was built with.
    pub fn settings(&self) -> &PeerSettings {
        &self.settings
    }

    /// Number of databases.
    pub fn database_count(&self) -> usize {
        self.databases.len()
    }

    /// Borrow a database object.
    pub fn database(&self, db_index: u8) -> Option<&TreeDatabase> {
        self.databases.get(db_index as usize)
    }

    /// Borrow the node store (read-only; mutations go through commands).
    pub fn store(&self) -> &NodeStore {
        &self.store
    }

    /// Mark every database steady. Called when the peer starts a fresh
    /// system (nothing to catch up from).
    pub fn mark_all_steady(&mut self) {
        for db in &mut self.databases {
            db.mark_steady();
        }
    }

    /// Route a client path (session-relative or absolute, wildcards
    /// allowed) to the first matching database.
    pub fn route(&self, path: &str) -> Option<(u8, Subpath)> {
        self.databases
            .iter()
            .find_map(|db| db.database_subpath(path).map(|sub| (db.db_index(), sub)))
    }

    /// The database that *owns* the node at a session-relative path: the
    /// first one routing it. Used by the safe-query check.
    fn owner_of(&self, path: &str) -> Option<u8> {
        self.route(path).map(|(i, _)| i)
    }

    fn current_context(&self) -> UpdateContext {
        self.context_stack.last().copied().unwrap_or(UpdateContext::None)
    }

    // ───────────────────────────────────────────────────────────────────
    // Command batching
    // ───────────────────────────────────────────────────────────────────

    /// Enter a command batch. Nestable; subscriber flush happens when the
    /// outermost batch ends.
    pub fn begin_command_batch(&mut self) {
        self.batch_nest += 1;
    }

    /// Leave a command batch, flushing subscribers at the outermost exit.
    pub fn end_command_batch(&mut self) {
        debug_assert!(self.batch_nest > 0);
        self.batch_nest = self.batch_nest.saturating_sub(1);
        if self.batch_nest == 0 {
            self.flush_notifications();
        }
    }

    fn flush_notifications(&mut self) {
        let events = std::mem::take(&mut self.pending);
        for event in &events {
            for (_, pattern, subscriber) in &mut self.subscribers {
                if !subscription_matches(pattern, event.path()) {
                    continue;
                }
                match event {
                    NodeEvent::Updated {
                        path,
                        new_payload,
                        removed,
                        ..
                    } => subscriber.on_node_updated(path, new_payload.as_ref(), *removed),
                    NodeEvent::IndexChanged {
                        path,
                        op,
                        position,
                        key,
                        ..
                    } => subscriber.on_node_index_changed(path, *op, *position, key),
                }
            }
        }
    }

    /// Register a subscriber for a session-relative path pattern.
    pub fn add_subscriber(&mut self, pattern: impl Into<String>, subscriber: Box<dyn TreeSubscriber>) -> SubscriberId {
        let id = SubscriberId(self.next_subscriber_id);
        self.next_subscriber_id += 1;
        self.subscribers.push((id, pattern.into(), subscriber));
        id
    }

    /// Remove a subscriber.
    pub fn remove_subscriber(&mut self, id: SubscriberId) {
        self.subscribers.retain(|(sid, _, _)| *sid != id);
    }

    /// Tell subscribers the peer's attachment state changed.
    pub fn notify_connection_state(&mut self, attached: bool) {
        for (_, _, subscriber) in &mut self.subscribers {
            subscriber.on_connection_state_changed(attached);
        }
    }

    // ───────────────────────────────────────────────────────────────────
    // Client request builders
    // ───────────────────────────────────────────────────────────────────

    /// Build an `UPDATE_NODE_VALUE` request for the database owning
    /// `path`. A `None` payload requests removal.
    pub fn build_upload_node_value(
        &self,
        path: &str,
        payload: Option<Payload>,
        flags: TreeFlags,
        before: Option<String>,
    ) -> Result<(u8, UpdateMessage)> {
        let (db_index, sub) = self
            .route(path)
            .ok_or_else(|| Error::bad_argument(format!("no database for path: {path}")))?;
        Ok((db_index, UpdateMessage::node_update(sub.relative, payload, flags, before)))
    }

    /// Build an `UPDATE_SUBTREE` request.
    pub fn build_upload_subtree(
        &self,
        path: &str,
        subtree: NodeArchive,
        flags: TreeFlags,
    ) -> Result<(u8, UpdateMessage)> {
        let (db_index, sub) = self
            .route(path)
            .ok_or_else(|| Error::bad_argument(format!("no database for path: {path}")))?;
        Ok((db_index, UpdateMessage::subtree_update(sub.relative, subtree, flags)))
    }

    /// Build a `REQUEST_DELETE_NODES` request.
    pub fn build_delete_nodes(
        &self,
        path: &str,
        filter: Option<NodeFilter>,
        flags: TreeFlags,
    ) -> Result<(u8, UpdateMessage)> {
        let (db_index, sub) = self
            .route(path)
            .ok_or_else(|| Error::bad_argument(format!("no database for path: {path}")))?;
        Ok((db_index, UpdateMessage::delete_request(sub.relative, filter, flags)))
    }

    /// Build a `MOVE_INDEX_ENTRY` request.
    pub fn build_move_index_entry(
        &self,
        path: &str,
        before: Option<String>,
        filter: Option<NodeFilter>,
        flags: TreeFlags,
    ) -> Result<(u8, UpdateMessage)> {
        let (db_index, sub) = self
            .route(path)
            .ok_or_else(|| Error::bad_argument(format!("no database for path: {path}")))?;
        Ok((db_index, UpdateMessage::move_index_request(sub.relative, before, filter, flags)))
    }

    /// Allocate the next unused integer child name under a
    /// session-relative parent path.
    pub fn get_unused_node_id(&mut self, parent_path: &str) -> u32 {
        self.store.unused_node_id(parent_path)
    }

    // ───────────────────────────────────────────────────────────────────
    // Senior / junior update entry points
    // ───────────────────────────────────────────────────────────────────

    /// Apply a request as the elected senior.
    ///
    /// Returns the assembled junior replay record — never empty (a NOOP
    /// substitutes) — together with the outcome. On error the replay
    /// record still covers the applied prefix: the senior does not roll
    /// back, and juniors must converge to the same partial state.
    pub fn senior_update(&mut self, db_index: u8, msg: &UpdateMessage) -> (UpdateMessage, Result<()>) {
        if self.databases.get(db_index as usize).is_none() {
            return (UpdateMessage::noop(), Err(Error::bad_argument(format!("no database {db_index}"))));
        }
        if !self.databases[db_index as usize].is_steady() {
            return (
                UpdateMessage::noop(),
                Err(Error::bad_argument(format!(
                    "database {db_index} not steady ({})",
                    self.databases[db_index as usize].state()
                ))),
            );
        }
        self.begin_command_batch();
        self.context_stack.push(UpdateContext::Senior);
        let outcome = self.dispatch_senior(db_index, msg);
        self.context_stack.pop();
        self.end_command_batch();
        if let Err(err) = &outcome {
            error!(db_index, what = code_name(msg.what), %err, "senior update failed");
        }
        let junior = self.databases[db_index as usize].take_assembled_junior();
        (junior, outcome)
    }

    fn dispatch_senior(&mut self, db_index: u8, msg: &UpdateMessage) -> Result<()> {
        match msg.what {
            codes::BATCH => {
                for sub in &msg.sub_messages {
                    self.dispatch_senior(db_index, sub)?;
                }
                Ok(())
            }
            codes::NOOP => Ok(()),
            codes::UPDATE_NODE_VALUE => self.handle_node_update(db_index, msg, true),
            codes::UPDATE_SUBTREE => self.handle_subtree_update(db_index, msg),
            codes::INSERT_INDEX_ENTRY | codes::REMOVE_INDEX_ENTRY => self.handle_index_update(db_index, msg),
            codes::REQUEST_DELETE_NODES => {
                let filter = msg.filter.clone();
                let quiet = msg.flags.contains(TreeFlags::NOREPLY);
                self.remove_nodes_in_database(db_index, msg.path_or_empty(), filter.as_ref(), quiet)
            }
            codes::MOVE_INDEX_ENTRY => {
                let filter = msg.filter.clone();
                self.move_index_entries_in_database(
                    db_index,
                    msg.path_or_empty(),
                    msg.before.as_deref(),
                    filter.as_ref(),
                )
            }
            codes::REQUEST_UNDO | codes::REQUEST_REDO => {
                // The undo stack lives above this layer; the opcode is
                // accepted so the wire surface is complete.
                info!(
                    db_index,
                    what = code_name(msg.what),
                    pattern = msg.key.as_deref().unwrap_or(""),
                    "undo/redo request acknowledged"
                );
                Ok(())
            }
            other => {
                error!(db_index, what = other, "unknown message code in senior update");
                Err(Error::Unimplemented(other))
            }
        }
    }

    /// Replay a senior-produced record on this junior, in sequence order.
    pub fn junior_update(&mut self, db_index: u8, msg: &UpdateMessage) -> Result<()> {
        if self.databases.get(db_index as usize).is_none() {
            return Err(Error::bad_argument(format!("no database {db_index}")));
        }
        if !self.databases[db_index as usize].is_steady() {
            return Err(Error::bad_argument(format!("database {db_index} not steady")));
        }
        self.begin_command_batch();
        self.context_stack.push(UpdateContext::Junior);
        let outcome = self.dispatch_junior(db_index, msg);
        self.context_stack.pop();
        self.end_command_batch();
        if let Err(err) = &outcome {
            error!(db_index, what = code_name(msg.what), %err, "junior update failed");
        }
        outcome
    }

    fn dispatch_junior(&mut self, db_index: u8, msg: &UpdateMessage) -> Result<()> {
        match msg.what {
            codes::BATCH => {
                for sub in &msg.sub_messages {
                    self.dispatch_junior(db_index, sub)?;
                }
                Ok(())
            }
            codes::NOOP => Ok(()),
            codes::UPDATE_NODE_VALUE => self.handle_node_update(db_index, msg, false),
            codes::INSERT_INDEX_ENTRY | codes::REMOVE_INDEX_ENTRY => self.handle_index_update(db_index, msg),
            codes::UPDATE_SUBTREE => {
                error!(db_index, "UPDATE_SUBTREE must not be used in a junior-peer context");
                Err(Error::bad_argument("UPDATE_SUBTREE in junior context"))
            }
            other if is_senior_only(other) => {
                error!(
                    db_index,
                    what = code_name(other),
                    "senior-only message code delivered to junior"
                );
                Err(Error::bad_argument(format!(
                    "senior-only code {} on junior",
                    code_name(other)
                )))
            }
            other => {
                error!(db_index, what = other, "unknown message code in junior update");
                Err(Error::Unimplemented(other))
            }
        }
    }

    // ───────────────────────────────────────────────────────────────────
    // Handlers
    // ───────────────────────────────────────────────────────────────────

    fn handle_node_update(&mut self, db_index: u8, msg: &UpdateMessage, senior: bool) -> Result<()> {
        let interim = msg.flags.contains(TreeFlags::INTERIM);
        if interim {
            self.databases[db_index as usize].push_interim();
        }
        let result = self.handle_node_update_inner(db_index, msg, senior);
        if interim {
            self.databases[db_index as usize].pop_interim();
        }
        result
    }

    fn handle_node_update_inner(&mut self, db_index: u8, msg: &UpdateMessage, senior: bool) -> Result<()> {
        let db = &self.databases[db_index as usize];
        let mut session_path = db.session_path(msg.path_or_empty());

        match &msg.payload {
            Some(payload) => {
                if senior && session_path.ends_with('/') {
                    // Client asked us to pick an available node ID.
                    let parent = session_path.trim_end_matches('/').to_string();
                    let id = self.store.unused_node_id(&parent);
                    let prefix = if msg.flags.contains(TreeFlags::INDEXED) { "I" } else { "" };
                    session_path = if parent.is_empty() {
                        format!("{prefix}{id}")
                    } else {
                        format!("{parent}/{prefix}{id}")
                    };
                    debug!(db_index, path = %session_path, "allocated node id");
                }
                let mut flags = StoreFlags::none();
                if msg.flags.contains(TreeFlags::NOREPLY) {
                    flags = flags.with(StoreFlags::QUIET);
                }
                if msg.flags.contains(TreeFlags::INDEXED) {
                    flags = flags.with(StoreFlags::ADD_TO_INDEX);
                }
                let mut events = Vec::new();
                self.store
                    .set_data_node(&session_path, payload.clone(), flags, msg.before.as_deref(), &mut events)?;
                self.dispatch_events(events);
                Ok(())
            }
            None => {
                let quiet = msg.flags.contains(TreeFlags::NOREPLY);
                self.remove_nodes_in_database(db_index, msg.path_or_empty(), None, quiet)
            }
        }
    }

    fn handle_subtree_update(&mut self, db_index: u8, msg: &UpdateMessage) -> Result<()> {
        let Some(subtree) = &msg.subtree else {
            error!(db_index, path = msg.path_or_empty(), "no subtree payload in UPDATE_SUBTREE");
            return Err(Error::bad_argument("UPDATE_SUBTREE without subtree"));
        };
        let session_path = self.databases[db_index as usize].session_path(msg.path_or_empty());
        let quiet = msg.flags.contains(TreeFlags::NOREPLY);
        let mut events = Vec::new();
        self.store.restore_subtree(&session_path, subtree, quiet, &mut events)?;
        self.dispatch_events(events);
        Ok(())
    }

    fn handle_index_update(&mut self, db_index: u8, msg: &UpdateMessage) -> Result<()> {
        let session_path = self.databases[db_index as usize].session_path(msg.path_or_empty());
        let position = msg.index.unwrap_or(0);
        let mut events = Vec::new();
        let result = match msg.what {
            codes::INSERT_INDEX_ENTRY => self.store.insert_index_entry_at(
                &session_path,
                position,
                msg.key.as_deref().unwrap_or(""),
                &mut events,
            ),
            _ => self.store.remove_index_entry_at(&session_path, position, &mut events),
        };
        if let Err(err) = &result {
            error!(path = %session_path, %err, "node-index update failed");
        }
        self.dispatch_events(events);
        result
    }

    /// Filtered recursive delete, restricted to the nodes the database
    /// owns (the safe-query rule) and to the optional request filter.
    fn remove_nodes_in_database(
        &mut self,
        db_index: u8,
        db_relative_path: &str,
        filter: Option<&NodeFilter>,
        quiet: bool,
    ) -> Result<()> {
        let session_path = self.databases[db_index as usize].session_path(db_relative_path);
        let databases = &self.databases;
        let accept = |path: &str, node: &DataNode| {
            let owned = databases
                .iter()
                .find_map(|db| db.database_subpath(path).map(|_| db.db_index()))
                == Some(db_index);
            if !owned {
                return false;
            }
            match filter {
                Some(f) => {
                    let name = segments(path).next_back().unwrap_or("");
                    f.matches(name, node.payload())
                }
                None => true,
            }
        };
        let mut events = Vec::new();
        self.store
            .remove_data_nodes(&session_path, &accept, quiet, &mut events)?;
        self.dispatch_events(events);
        Ok(())
    }

    /// Filtered index reorder, restricted like
    /// [`Self::remove_nodes_in_database`].
    fn move_index_entries_in_database(
        &mut self,
        db_index: u8,
        db_relative_path: &str,
        before: Option<&str>,
        filter: Option<&NodeFilter>,
    ) -> Result<()> {
        let session_path = self.databases[db_index as usize].session_path(db_relative_path);
        let databases = &self.databases;
        let accept = |path: &str, node: &DataNode| {
            let owned = databases
                .iter()
                .find_map(|db| db.database_subpath(path).map(|_| db.db_index()))
                == Some(db_index);
            if !owned {
                return false;
            }
            match filter {
                Some(f) => {
                    let name = segments(path).next_back().unwrap_or("");
                    f.matches(name, node.payload())
                }
                None => true,
            }
        };
        let mut events = Vec::new();
        self.store
            .move_index_entries(&session_path, before, &accept, &mut events)?;
        self.dispatch_events(events);
        Ok(())
    }

    /// Hand each store event to the owning database and queue it for
    /// subscriber flush.
    fn dispatch_events(&mut self, events: Vec<NodeEvent>) {
        let ctx = self.current_context();
        for event in events {
            if let Some((db_index, sub)) = self.route(event.path()) {
                self.databases[db_index as usize].apply_event(&sub.relative, &event, ctx);
            } else {
                // Scaffold interiors above every database root (e.g. "dbs")
                // belong to no database and carry no checksum weight.
                debug!(path = event.path(), "store event outside every database");
            }
            if !event.is_quiet() && ctx != UpdateContext::SetupOrTeardown {
                self.pending.push(event);
            }
        }
    }

    // ───────────────────────────────────────────────────────────────────
    // Archives / lifecycle
    // ───────────────────────────────────────────────────────────────────

    /// Archive a database's whole subtree.
    pub fn save_to_archive(&self, db_index: u8) -> Result<NodeArchive> {
        let db = self
            .databases
            .get(db_index as usize)
            .ok_or_else(|| Error::bad_argument(format!("no database {db_index}")))?;
        Ok(self.store.save_subtree(db.root_path()).unwrap_or_default())
    }

    /// Rebuild a database from a catch-up archive. Existing content is
    /// torn down first; subscriber dispatch is suppressed throughout.
    pub fn set_from_archive(&mut self, db_index: u8, archive: &NodeArchive) -> Result<()> {
        if self.databases.get(db_index as usize).is_none() {
            return Err(Error::bad_argument(format!("no database {db_index}")));
        }
        self.context_stack.push(UpdateContext::SetupOrTeardown);
        self.databases[db_index as usize].begin_building();
        let result = (|| -> Result<()> {
            self.clear_database_content(db_index)?;
            let root = self.databases[db_index as usize].root_path().to_string();
            let mut events = Vec::new();
            self.store.restore_subtree(&root, archive, true, &mut events)?;
            self.dispatch_events(events);
            Ok(())
        })();
        self.databases[db_index as usize].finish_building();
        self.context_stack.pop();
        result
    }

    /// Reset a database to its default (empty) state.
    pub fn set_to_default_state(&mut self, db_index: u8) -> Result<()> {
        if self.databases.get(db_index as usize).is_none() {
            return Err(Error::bad_argument(format!("no database {db_index}")));
        }
        self.context_stack.push(UpdateContext::SetupOrTeardown);
        self.databases[db_index as usize].begin_resetting();
        let result = self.clear_database_content(db_index);
        self.databases[db_index as usize].finish_resetting();
        self.context_stack.pop();
        result
    }

    fn clear_database_content(&mut self, db_index: u8) -> Result<()> {
        let root = self.databases[db_index as usize].root_path().to_string();
        let databases = &self.databases;
        let accept = |path: &str, _node: &DataNode| {
            databases
                .iter()
                .find_map(|db| db.database_subpath(path).map(|_| db.db_index()))
                == Some(db_index)
        };
        let mut events = Vec::new();
        self.store.remove_data_nodes(&root, &accept, true, &mut events)?;
        self.dispatch_events(events);
        Ok(())
    }

    /// Full O(subtree) recompute of a database's checksum, for
    /// verification against the running value.
    pub fn calculate_checksum(&self, db_index: u8) -> u32 {
        self.databases
            .get(db_index as usize)
            .and_then(|db| self.store.get(db.root_path()))
            .map(DataNode::calculate_checksum)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn session_with_roots(roots: &[&str]) -> PeerSession {
        let mut settings = PeerSettings::for_testing("test");
        settings.num_databases = roots.len() as u8;
        settings.database_roots = roots.iter().map(|s| s.to_string()).collect();
        PeerSession::new(settings).unwrap()
    }

    fn payload(tag: &str) -> Payload {
        let mut p = Payload::new();
        p.put_str("tag", tag);
        p
    }

    fn assert_consistent(session: &PeerSession, db_index: u8) {
        assert_eq!(
            session.database(db_index).unwrap().current_checksum(),
            session.calculate_checksum(db_index),
            "running checksum must match recompute for db {db_index}"
        );
    }

    #[test]
    fn test_route_first_match_wins() {
        let session = session_with_roots(&["a", "b"]);
        assert_eq!(session.route("a/x").unwrap().0, 0);
        assert_eq!(session.route("b/x").unwrap().0, 1);
        assert!(session.route("c/x").is_none());
    }

    #[test]
    fn test_single_insert_scenario() {
        // Empty database rooted at "magnets": one UPDATE_NODE_VALUE with
        // empty relative path lands on the root node.
        let mut session = session_with_roots(&["magnets"]);
        session.mark_all_steady();
        let p = Payload::from([("", vec![7u8])]);
        assert_eq!(p.checksum(), 7);

        let (db_index, msg) = session
            .build_upload_node_value("magnets", Some(p.clone()), TreeFlags::none(), None)
            .unwrap();
        assert_eq!(db_index, 0);
        let (junior, outcome) = session.senior_update(0, &msg);
        outcome.unwrap();

        assert_eq!(session.database(0).unwrap().current_checksum(), 7);
        assert_consistent(&session, 0);
        assert_eq!(
            session.store().get("magnets").unwrap().payload(),
            Some(&p)
        );

        // Junior replay produces an identical tree.
        let mut junior_session = session_with_roots(&["magnets"]);
        junior_session.mark_all_steady();
        junior_session.junior_update(0, &junior).unwrap();
        assert_eq!(junior_session.database(0).unwrap().current_checksum(), 7);
        assert_consistent(&junior_session, 0);
    }

    #[test]
    fn test_indexed_child_allocation_scenario() {
        let mut session = session_with_roots(&["magnets"]);
        session.mark_all_steady();

        let (db_index, msg) = session
            .build_upload_node_value("magnets/", Some(payload("p")), TreeFlags::INDEXED, None)
            .unwrap();
        assert_eq!(db_index, 0);
        assert!(msg.path_or_empty().ends_with('/'));

        let (junior, outcome) = session.senior_update(0, &msg);
        outcome.unwrap();

        // Senior allocated "I0".
        assert!(session.store().get("magnets/I0").is_some());
        assert_eq!(session.store().get("magnets").unwrap().index().unwrap(), &["I0"]);
        assert_consistent(&session, 0);

        // Junior replay receives the explicit path and index primitive.
        let mut junior_session = session_with_roots(&["magnets"]);
        junior_session.mark_all_steady();
        junior_session.junior_update(0, &junior).unwrap();
        assert!(junior_session.store().get("magnets/I0").is_some());
        assert_eq!(
            junior_session.store().get("magnets").unwrap().index().unwrap(),
            &["I0"]
        );
        assert_eq!(
            junior_session.database(0).unwrap().current_checksum(),
            session.database(0).unwrap().current_checksum()
        );
    }

    #[test]
    fn test_move_index_entry_scenario() {
        let mut session = session_with_roots(&["magnets"]);
        session.mark_all_steady();
        for _ in 0..3 {
            let (_, msg) = session
                .build_upload_node_value("magnets/", Some(payload("m")), TreeFlags::INDEXED, None)
                .unwrap();
            session.senior_update(0, &msg).1.unwrap();
        }
        assert_eq!(
            session.store().get("magnets").unwrap().index().unwrap(),
            &["I0", "I1", "I2"]
        );
        let before_checksum = session.database(0).unwrap().current_checksum();

        let (_, msg) = session
            .build_move_index_entry(
                "magnets",
                Some("I0".into()),
                Some(NodeFilter::named("I2")),
                TreeFlags::none(),
            )
            .unwrap();
        let (junior, outcome) = session.senior_update(0, &msg);
        outcome.unwrap();

        assert_eq!(
            session.store().get("magnets").unwrap().index().unwrap(),
            &["I2", "I0", "I1"]
        );
        assert_eq!(session.database(0).unwrap().current_checksum(), before_checksum);
        assert_consistent(&session, 0);

        // The junior record is positional primitives only.
        fn all_primitives(msg: &UpdateMessage) -> bool {
            match msg.what {
                codes::BATCH => msg.sub_messages.iter().all(all_primitives),
                codes::INSERT_INDEX_ENTRY | codes::REMOVE_INDEX_ENTRY => true,
                _ => false,
            }
        }
        assert!(all_primitives(&junior));
    }

    #[test]
    fn test_filter_scoped_delete_scenario() {
        let mut session = session_with_roots(&["a", "b"]);
        session.mark_all_steady();
        for (path, db) in [("a/x", 0u8), ("a/y", 0), ("b/x", 1)] {
            let (db_index, msg) = session
                .build_upload_node_value(path, Some(payload(path)), TreeFlags::none(), None)
                .unwrap();
            assert_eq!(db_index, db);
            session.senior_update(db_index, &msg).1.unwrap();
        }

        // Wildcard delete routed to database A must leave B untouched.
        let msg = UpdateMessage::delete_request("*", Some(NodeFilter::All), TreeFlags::none());
        session.senior_update(0, &msg).1.unwrap();

        assert!(session.store().get("a/x").is_none());
        assert!(session.store().get("a/y").is_none());
        assert!(session.store().get("b/x").is_some());
        assert_consistent(&session, 0);
        assert_consistent(&session, 1);
    }

    #[test]
    fn test_interim_coalesce_scenario() {
        let mut session = session_with_roots(&["magnets"]);
        session.mark_all_steady();

        let (_, msg1) = session
            .build_upload_node_value("magnets/k", Some(payload("v1")), TreeFlags::INTERIM, None)
            .unwrap();
        let (_, msg2) = session
            .build_upload_node_value("magnets/k", Some(payload("v2")), TreeFlags::INTERIM, None)
            .unwrap();
        let (junior1, r1) = session.senior_update(0, &msg1);
        r1.unwrap();
        let (junior2, r2) = session.senior_update(0, &msg2);
        r2.unwrap();

        assert!(junior1.flags.contains(TreeFlags::INTERIM) || !junior1.sub_messages.is_empty());
        assert!(junior2.flags.contains(TreeFlags::INTERIM) || !junior2.sub_messages.is_empty());

        // Final payload is the last one; running checksum consistent.
        assert_eq!(
            session.store().get("magnets/k").unwrap().payload(),
            Some(&payload("v2"))
        );
        assert_consistent(&session, 0);
    }

    #[test]
    fn test_noop_is_fixed_point() {
        let mut session = session_with_roots(&["magnets"]);
        session.mark_all_steady();
        let (_, msg) = session
            .build_upload_node_value("magnets/a", Some(payload("a")), TreeFlags::none(), None)
            .unwrap();
        session.senior_update(0, &msg).1.unwrap();
        let checksum = session.database(0).unwrap().current_checksum();

        let (junior, outcome) = session.senior_update(0, &UpdateMessage::noop());
        outcome.unwrap();
        assert!(junior.is_noop());
        assert_eq!(session.database(0).unwrap().current_checksum(), checksum);

        session.junior_update(0, &UpdateMessage::noop()).unwrap();
        assert_eq!(session.database(0).unwrap().current_checksum(), checksum);
    }

    #[test]
    fn test_junior_rejects_senior_only_codes() {
        let mut session = session_with_roots(&["magnets"]);
        session.mark_all_steady();
        let delete = UpdateMessage::delete_request("*", None, TreeFlags::none());
        assert!(matches!(
            session.junior_update(0, &delete),
            Err(Error::BadArgument(_))
        ));
        let mv = UpdateMessage::move_index_request("", None, None, TreeFlags::none());
        assert!(matches!(session.junior_update(0, &mv), Err(Error::BadArgument(_))));

        let subtree = UpdateMessage::subtree_update("", NodeArchive::default(), TreeFlags::none());
        assert!(matches!(
            session.junior_update(0, &subtree),
            Err(Error::BadArgument(_))
        ));
    }

    #[test]
    fn test_unknown_code_unimplemented() {
        let mut session = session_with_roots(&["magnets"]);
        session.mark_all_steady();
        let mut msg = UpdateMessage::noop();
        msg.what = 0x1234_5678;
        let (junior, outcome) = session.senior_update(0, &msg);
        assert!(matches!(outcome, Err(Error::Unimplemented(_))));
        assert!(junior.is_noop());
        assert!(matches!(
            session.junior_update(0, &msg),
            Err(Error::Unimplemented(_))
        ));
    }

    #[test]
    fn test_batch_error_keeps_applied_prefix() {
        let mut session = session_with_roots(&["magnets"]);
        session.mark_all_steady();

        let good = UpdateMessage::node_update("a", Some(payload("a")), TreeFlags::none(), None);
        let bad = UpdateMessage::index_update(codes::REMOVE_INDEX_ENTRY, "missing", 0, "");
        let after = UpdateMessage::node_update("z", Some(payload("z")), TreeFlags::none(), None);
        let batch = UpdateMessage::batch(vec![good, bad, after]);

        let (junior, outcome) = session.senior_update(0, &batch);
        assert!(outcome.is_err());
        // The applied prefix stays applied and is still replicated.
        assert!(session.store().get("magnets/a").is_some());
        assert!(session.store().get("magnets/z").is_none());
        assert!(!junior.is_noop());
        assert_consistent(&session, 0);

        // A junior replaying the partial record converges to the same
        // partial state.
        let mut junior_session = session_with_roots(&["magnets"]);
        junior_session.mark_all_steady();
        junior_session.junior_update(0, &junior).unwrap();
        assert_eq!(
            junior_session.database(0).unwrap().current_checksum(),
            session.database(0).unwrap().current_checksum()
        );
    }

    #[test]
    fn test_archive_roundtrip_between_sessions() {
        let mut session = session_with_roots(&["magnets"]);
        session.mark_all_steady();
        for _ in 0..3 {
            let (_, msg) = session
                .build_upload_node_value("magnets/", Some(payload("m")), TreeFlags::INDEXED, None)
                .unwrap();
            session.senior_update(0, &msg).1.unwrap();
        }
        let (_, msg) = session
            .build_upload_node_value("magnets/I0/deep", Some(payload("deep")), TreeFlags::none(), None)
            .unwrap();
        session.senior_update(0, &msg).1.unwrap();

        let archive = session.save_to_archive(0).unwrap();

        let mut fresh = session_with_roots(&["magnets"]);
        fresh.set_from_archive(0, &archive).unwrap();
        assert!(fresh.database(0).unwrap().is_steady());
        assert_eq!(
            fresh.database(0).unwrap().current_checksum(),
            session.database(0).unwrap().current_checksum()
        );
        assert_consistent(&fresh, 0);
        assert_eq!(
            fresh.store().get("magnets").unwrap().index().unwrap(),
            session.store().get("magnets").unwrap().index().unwrap()
        );
    }

    #[test]
    fn test_set_to_default_state() {
        let mut session = session_with_roots(&["magnets"]);
        session.mark_all_steady();
        let (_, msg) = session
            .build_upload_node_value("magnets/a", Some(payload("a")), TreeFlags::none(), None)
            .unwrap();
        session.senior_update(0, &msg).1.unwrap();
        assert_ne!(session.database(0).unwrap().current_checksum(), 0);

        session.set_to_default_state(0).unwrap();
        assert_eq!(session.database(0).unwrap().current_checksum(), 0);
        assert_eq!(session.calculate_checksum(0), 0);
        assert!(session.store().get("magnets/a").is_none());
        assert_eq!(session.database(0).unwrap().state(), crate::database::DbState::Empty);
    }

    #[test]
    fn test_updates_rejected_outside_steady() {
        let mut session = session_with_roots(&["magnets"]);
        // Databases start Empty.
        let msg = UpdateMessage::node_update("a", Some(payload("a")), TreeFlags::none(), None);
        let (_, outcome) = session.senior_update(0, &msg);
        assert!(outcome.is_err());
        assert!(session.junior_update(0, &msg).is_err());
    }

    struct CountingSubscriber {
        updates: Arc<AtomicUsize>,
        index_changes: Arc<AtomicUsize>,
    }

    impl TreeSubscriber for CountingSubscriber {
        fn on_node_updated(&mut self, _path: &str, _payload: Option<&Payload>, _removed: bool) {
            self.updates.fetch_add(1, Ordering::SeqCst);
        }
        fn on_node_index_changed(&mut self, _path: &str, _op: IndexOp, _position: u32, _key: &str) {
            self.index_changes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_subscriber_flush_per_batch() {
        let mut session = session_with_roots(&["magnets"]);
        session.mark_all_steady();
        let updates = Arc::new(AtomicUsize::new(0));
        let index_changes = Arc::new(AtomicUsize::new(0));
        session.add_subscriber(
            "magnets/*",
            Box::new(CountingSubscriber {
                updates: Arc::clone(&updates),
                index_changes: Arc::clone(&index_changes),
            }),
        );

        let (_, msg) = session
            .build_upload_node_value("magnets/", Some(payload("m")), TreeFlags::INDEXED, None)
            .unwrap();
        session.senior_update(0, &msg).1.unwrap();

        // The node at depth 2 matches; the index event fires on "magnets"
        // (depth 1) which the pattern does not match.
        assert_eq!(updates.load(Ordering::SeqCst), 1);
        assert_eq!(index_changes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_noreply_suppresses_subscriber_dispatch() {
        let mut session = session_with_roots(&["magnets"]);
        session.mark_all_steady();
        let updates = Arc::new(AtomicUsize::new(0));
        session.add_subscriber(
            "magnets/*",
            Box::new(CountingSubscriber {
                updates: Arc::clone(&updates),
                index_changes: Arc::new(AtomicUsize::new(0)),
            }),
        );

        let (_, msg) = session
            .build_upload_node_value("magnets/q", Some(payload("q")), TreeFlags::NOREPLY, None)
            .unwrap();
        session.senior_update(0, &msg).1.unwrap();
        assert_eq!(updates.load(Ordering::SeqCst), 0);
        // State still updated.
        assert!(session.store().get("magnets/q").is_some());
        assert_consistent(&session, 0);
    }

    #[test]
    fn test_undo_redo_opcodes_accepted() {
        let mut session = session_with_roots(&["magnets"]);
        session.mark_all_steady();
        let undo = UpdateMessage::undo_request(codes::REQUEST_UNDO, "magnets/*");
        let (junior, outcome) = session.senior_update(0, &undo);
        outcome.unwrap();
        assert!(junior.is_noop());
        // Junior must refuse them.
        assert!(session.junior_update(0, &undo).is_err());
    }

    #[test]
    fn test_get_unused_node_id_contract() {
        let mut session = session_with_roots(&["magnets"]);
        session.mark_all_steady();
        let first = session.get_unused_node_id("magnets");
        let second = session.get_unused_node_id("magnets");
        assert!(second > first);
    }
}
