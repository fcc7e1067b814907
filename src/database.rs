// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-database replication object.
//!
//! A [`TreeDatabase`] owns one replicated subtree of the session's node
//! store, identified by a session-relative root path (possibly empty: the
//! session node itself). It does not hold the nodes — the store does — it
//! holds everything replication needs to know *about* them:
//!
//! - the running 32-bit checksum, maintained incrementally from store
//!   events and verifiable against a full recompute at any time;
//! - the *assembled junior message*: while a senior update is in progress,
//!   every store event is recorded as a replay primitive, and the batch of
//!   primitives is what juniors receive;
//! - the interim nest count (updates applied inside an INTERIM request are
//!   recorded as coalescable);
//! - the subpath routing that decides whether a client path belongs to
//!   this database, and at how many hops below its root.
//!
//! # State machine
//!
//! ```text
//!            set_from_archive()              set_to_default_state()
//! Empty ──────────→ Building ──────→ Steady ──────────→ Resetting ──┐
//!   ↑                                  ↑                            │
//!   └──────────────────────────────────┴────────────────────────────┘
//! ```
//!
//! Updates are accepted only in `Steady`. `Building` and `Resetting` are
//! setup-or-teardown phases: store events still maintain the checksum but
//! are not recorded for juniors and are not pushed to subscribers.

use crate::checksum::{combine, remove, str_checksum};
use crate::message::{codes, TreeFlags, UpdateMessage};
use crate::node::{IndexOp, NodeEvent};
use crate::path::{is_wildcard, path_clause, path_depth, segments_prefix_match, session_relative};
use crate::payload::Payload;
use tracing::{debug, error};

/// Lifecycle state of a database object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbState {
    /// No content yet (fresh start or after a reset).
    Empty,
    /// A catch-up archive is being restored.
    Building,
    /// Normal operation; updates accepted.
    Steady,
    /// Content is being torn down.
    Resetting,
}

impl std::fmt::Display for DbState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DbState::Empty => write!(f, "Empty"),
            DbState::Building => write!(f, "Building"),
            DbState::Steady => write!(f, "Steady"),
            DbState::Resetting => write!(f, "Resetting"),
        }
    }
}

/// The execution context a store event is observed under. Pushed by the
/// session for the duration of each update; see the session's context
/// stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateContext {
    /// Applying a client request on the elected senior; events are
    /// recorded into the assembled junior message.
    Senior,
    /// Replaying a senior-produced record; events maintain state only.
    Junior,
    /// Restoring an archive or resetting to default; subscriber dispatch
    /// is suppressed.
    SetupOrTeardown,
    /// No context — a mutation here is a bug in the caller.
    None,
}

/// Result of routing a path to a database: how many hops below the
/// database root the path lands, and the database-relative remainder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subpath {
    pub hops: u32,
    pub relative: String,
}

/// Replication state for one database subtree.
#[derive(Debug)]
pub struct TreeDatabase {
    db_index: u8,
    root: String,
    root_prefix: String,
    root_depth: u32,
    checksum: u32,
    state: DbState,
    assembled_junior: Option<UpdateMessage>,
    interim_nest: u32,
}

impl TreeDatabase {
    /// Create a database rooted at `root_path` (session-relative, no
    /// trailing slash, possibly empty).
    pub fn new(db_index: u8, root_path: &str) -> Self {
        let root = root_path.trim_end_matches('/').to_string();
        let root_prefix = format!("{root}/");
        let root_depth = path_depth(&root);
        Self {
            db_index,
            root,
            root_prefix,
            root_depth,
            checksum: 0,
            state: DbState::Empty,
            assembled_junior: None,
            interim_nest: 0,
        }
    }

    /// This database's index within the session.
    pub fn db_index(&self) -> u8 {
        self.db_index
    }

    /// Session-relative root path (no trailing slash; empty for the
    /// session node itself).
    pub fn root_path(&self) -> &str {
        &self.root
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DbState {
        self.state
    }

    /// True when updates are accepted.
    pub fn is_steady(&self) -> bool {
        self.state == DbState::Steady
    }

    /// O(1) running checksum.
    pub fn current_checksum(&self) -> u32 {
        self.checksum
    }

    /// Move `Empty → Steady` when the peer starts with no catch-up needed
    /// (e.g. it is the first/senior peer of the system).
    pub fn mark_steady(&mut self) {
        debug!(db_index = self.db_index, from = %self.state, "database steady");
        self.state = DbState::Steady;
    }

    /// Enter the archive-restore phase.
    pub fn begin_building(&mut self) {
        self.state = DbState::Building;
    }

    /// Leave the archive-restore phase.
    pub fn finish_building(&mut self) {
        self.state = DbState::Steady;
    }

    /// Enter the teardown phase.
    pub fn begin_resetting(&mut self) {
        self.state = DbState::Resetting;
    }

    /// Leave the teardown phase. The checksum is reset with the content.
    pub fn finish_resetting(&mut self) {
        self.state = DbState::Empty;
        self.checksum = 0;
        self.assembled_junior = None;
        self.interim_nest = 0;
    }

    /// Increment the interim nesting level (a coalescable request is being
    /// handled).
    pub fn push_interim(&mut self) {
        self.interim_nest += 1;
    }

    /// Decrement the interim nesting level.
    pub fn pop_interim(&mut self) {
        debug_assert!(self.interim_nest > 0);
        self.interim_nest = self.interim_nest.saturating_sub(1);
    }

    /// Take the junior replay record assembled during the current senior
    /// update. Never empty: a NOOP is substituted when no observable
    /// change occurred, so the sequence stream stays gapless.
    pub fn take_assembled_junior(&mut self) -> UpdateMessage {
        self.assembled_junior.take().unwrap_or_else(UpdateMessage::noop)
    }

    /// True if any replay record has been assembled in this batch.
    pub fn has_assembled_junior(&self) -> bool {
        self.assembled_junior.is_some()
    }

    // ───────────────────────────────────────────────────────────────────
    // Subpath routing
    // ───────────────────────────────────────────────────────────────────

    /// Route a path to this database.
    ///
    /// Absolute paths (leading `/`) are converted to session-relative
    /// first. Wildcard paths match when their leading segments can match
    /// the database root. A trailing `/` in the input is preserved in the
    /// relative result — it signals pick-an-ID to the senior.
    ///
    /// Returns `None` when the path lies outside this database.
    pub fn database_subpath(&self, path: &str) -> Option<Subpath> {
        if path.starts_with('/') {
            return self.database_subpath(&session_relative(path));
        }
        if is_wildcard(path) {
            let depth = path_depth(path);
            if depth < self.root_depth {
                return None;
            }
            if segments_prefix_match(path, &self.root, self.root_depth as usize) {
                return Some(Subpath {
                    hops: depth - self.root_depth,
                    relative: path_clause(self.root_depth as usize, path),
                });
            }
            return None;
        }
        if path == self.root {
            return Some(Subpath {
                hops: 0,
                relative: String::new(),
            });
        }
        if self.root.is_empty() || path.starts_with(&self.root_prefix) {
            let mut relative = if self.root.is_empty() {
                path.to_string()
            } else {
                path[self.root_prefix.len()..].to_string()
            };
            if relative.is_empty() && !path.ends_with('/') {
                return None;
            }
            // "foo/" counts one hop deeper than "foo" (the to-be-created
            // ID node); a bare "<root>/" is one hop below the root.
            let hops = relative.matches('/').count() as u32 + 1;
            if path.ends_with('/') && !relative.ends_with('/') {
                relative.push('/');
            }
            return Some(Subpath { hops, relative });
        }
        None
    }

    /// Convert a database-relative subpath back to a session-relative
    /// path. The pick-an-ID sentinel `"/"` maps to `"<root>/"`.
    pub fn session_path(&self, subpath: &str) -> String {
        if subpath.is_empty() {
            self.root.clone()
        } else if self.root.is_empty() {
            subpath.to_string()
        } else {
            format!("{}{}", self.root_prefix, subpath.trim_start_matches('/'))
        }
    }

    // ───────────────────────────────────────────────────────────────────
    // Event application (checksum + junior assembly)
    // ───────────────────────────────────────────────────────────────────

    /// Apply a store event that landed inside this database's subtree.
    ///
    /// `relative_path` is the path relative to the database root. In a
    /// senior context the event is also recorded into the assembled junior
    /// message; outside any context a critical log is emitted (store
    /// mutations must only happen under an update context).
    pub fn apply_event(&mut self, relative_path: &str, event: &NodeEvent, ctx: UpdateContext) {
        if ctx == UpdateContext::None {
            error!(
                db_index = self.db_index,
                path = relative_path,
                root = %self.root,
                "node mutated outside any update context"
            );
        }
        match event {
            NodeEvent::Updated {
                old_payload,
                new_payload,
                removed,
                subtree_checksum,
                ..
            } => {
                if ctx == UpdateContext::Senior {
                    self.record_node_update(relative_path, if *removed { None } else { new_payload.clone() });
                }
                if *removed {
                    self.checksum = remove(self.checksum, *subtree_checksum);
                } else {
                    if let Some(old) = old_payload {
                        self.checksum = remove(self.checksum, old.checksum());
                    }
                    if let Some(new) = new_payload {
                        self.checksum = combine(self.checksum, new.checksum());
                    }
                }
            }
            NodeEvent::IndexChanged { op, position, key, .. } => {
                match op {
                    IndexOp::Inserted => {
                        if ctx == UpdateContext::Senior {
                            self.record_index_update(codes::INSERT_INDEX_ENTRY, relative_path, *position, key);
                        }
                        self.checksum = combine(self.checksum, str_checksum(key));
                    }
                    IndexOp::Removed => {
                        if ctx == UpdateContext::Senior {
                            self.record_index_update(codes::REMOVE_INDEX_ENTRY, relative_path, *position, key);
                        }
                        self.checksum = remove(self.checksum, str_checksum(key));
                    }
                    IndexOp::Cleared => {
                        // Correct delta would be -Σ key checksums over the
                        // cleared entries; no current operation emits this.
                        error!(
                            db_index = self.db_index,
                            path = relative_path,
                            "checksum update for cleared index is not implemented"
                        );
                    }
                }
            }
        }
    }

    fn record_node_update(&mut self, relative_path: &str, payload: Option<Payload>) {
        let flags = if self.interim_nest > 0 {
            TreeFlags::INTERIM
        } else {
            TreeFlags::none()
        };
        let msg = UpdateMessage::node_update(relative_path, payload, flags, None);
        UpdateMessage::append_to_batch(&mut self.assembled_junior, msg);
    }

    fn record_index_update(&mut self, what: u32, relative_path: &str, position: u32, key: &str) {
        let msg = UpdateMessage::index_update(what, relative_path, position, key);
        UpdateMessage::append_to_batch(&mut self.assembled_junior, msg);
    }
}
