// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Hierarchical node store.
//!
//! A [`NodeStore`] owns one tree of [`DataNode`]s rooted at the peer
//! session's node (depth 0, empty name). Nodes carry an optional
//! [`Payload`], an unordered children map, and an optional ordered *index*
//! over a subset of the children.
//!
//! # Events
//!
//! Every mutating operation appends [`NodeEvent`]s to a caller-supplied
//! buffer instead of invoking callbacks. The session dispatches the buffer
//! afterwards: database objects consume events to maintain their running
//! checksums and (in a senior context) to assemble the junior replay
//! record; subscribers receive the non-quiet ones at batch flush. This
//! keeps the store free of back-references and makes reentrancy explicit.
//!
//! Event ordering matters for removals: a removed subtree reports children
//! before parents, so each node's reported subtree checksum covers only
//! what is still attached beneath it at that moment. Summing the reported
//! checksums therefore equals the subtree's original total exactly once.

use crate::checksum::{combine, str_checksum};
use crate::error::{Error, Result};
use crate::path::{glob_match, is_wildcard, segments};
use crate::payload::Payload;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Store-level flags for [`NodeStore::set_data_node`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreFlags(u32);

impl StoreFlags {
    /// Add the target node to its parent's ordered index.
    pub const ADD_TO_INDEX: StoreFlags = StoreFlags(1 << 0);
    /// Mark resulting events quiet: subscriber dispatch is suppressed,
    /// checksum and state maintenance still happen.
    pub const QUIET: StoreFlags = StoreFlags(1 << 1);

    /// The empty flag set.
    pub fn none() -> Self {
        StoreFlags(0)
    }

    /// Union of two flag sets.
    pub fn with(self, other: StoreFlags) -> Self {
        StoreFlags(self.0 | other.0)
    }

    /// True if every bit of `other` is set.
    pub fn contains(self, other: StoreFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Index mutation kind reported by [`NodeEvent::IndexChanged`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOp {
    /// `key` was inserted at `position`.
    Inserted,
    /// `key` was removed from `position`.
    Removed,
    /// The whole index was dropped. Not produced by any current operation.
    Cleared,
}

/// A mutation record produced by the store.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// A node was created, its payload replaced, or the node removed.
    Updated {
        /// Session-relative path of the affected node.
        path: String,
        /// Payload before the mutation (`None` for creations and for nodes
        /// that had no payload).
        old_payload: Option<Payload>,
        /// Payload after the mutation (`None` for removals and payloadless
        /// interior nodes).
        new_payload: Option<Payload>,
        /// True when the node is being unlinked.
        removed: bool,
        /// The node's subtree checksum at event time. Only meaningful for
        /// removals, where it is captured after the children and index
        /// entries have already reported their own removal — summing over
        /// all events therefore counts each unit exactly once. For other
        /// updates the old/new payloads carry the delta.
        subtree_checksum: u32,
        /// Subscriber dispatch suppressed.
        quiet: bool,
    },
    /// An entry was inserted into or removed from a node's ordered index.
    IndexChanged {
        /// Session-relative path of the node owning the index.
        path: String,
        op: IndexOp,
        /// Position of the entry within the index.
        position: u32,
        /// The child name the entry refers to.
        key: String,
        /// Subscriber dispatch suppressed.
        quiet: bool,
    },
}

impl NodeEvent {
    /// Session-relative path of the affected node.
    pub fn path(&self) -> &str {
        match self {
            NodeEvent::Updated { path, .. } => path,
            NodeEvent::IndexChanged { path, .. } => path,
        }
    }

    /// True if subscriber dispatch is suppressed for this event.
    pub fn is_quiet(&self) -> bool {
        match self {
            NodeEvent::Updated { quiet, .. } => *quiet,
            NodeEvent::IndexChanged { quiet, .. } => *quiet,
        }
    }
}

/// One node in the tree.
#[derive(Debug, Clone, Default)]
pub struct DataNode {
    payload: Option<Payload>,
    children: HashMap<String, DataNode>,
    index: Option<Vec<String>>,
}

impl DataNode {
    /// The node's payload, if any.
    pub fn payload(&self) -> Option<&Payload> {
        self.payload.as_ref()
    }

    /// Unordered iteration over child (name, node) pairs. Enumeration order
    /// is unspecified.
    pub fn children(&self) -> impl Iterator<Item = (&str, &DataNode)> {
        self.children.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of children.
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Look up a direct child by name.
    pub fn child(&self, name: &str) -> Option<&DataNode> {
        self.children.get(name)
    }

    /// The ordered index, if this node has one.
    pub fn index(&self) -> Option<&[String]> {
        self.index.as_deref()
    }

    fn index_position(&self, key: &str) -> Option<usize> {
        self.index.as_ref().and_then(|ix| ix.iter().position(|k| k == key))
    }

    /// Full recomputation of the subtree checksum: payload checksum, plus
    /// every child's subtree checksum, plus every index key's string
    /// checksum, combined with wrapping add.
    pub fn calculate_checksum(&self) -> u32 {
        let mut cs = self.payload.as_ref().map(Payload::checksum).unwrap_or(0);
        for child in self.children.values() {
            cs = combine(cs, child.calculate_checksum());
        }
        if let Some(index) = &self.index {
            for key in index {
                cs = combine(cs, str_checksum(key));
            }
        }
        cs
    }

    /// Archive this node and everything beneath it.
    pub fn to_archive(&self) -> NodeArchive {
        NodeArchive {
            payload: self.payload.clone(),
            index: self.index.clone(),
            children: self
                .children
                .iter()
                .map(|(name, child)| (name.clone(), child.to_archive()))
                .collect(),
        }
    }
}

/// Serialized form of a subtree, used for `UPDATE_SUBTREE` messages and
/// full-state catch-up archives. Children are in a `BTreeMap` so archives
/// of equal trees are byte-identical on every peer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeArchive {
    pub payload: Option<Payload>,
    pub index: Option<Vec<String>>,
    pub children: BTreeMap<String, NodeArchive>,
}

impl NodeArchive {
    /// Checksum of the archived subtree (same rule as a live node).
    pub fn calculate_checksum(&self) -> u32 {
        let mut cs = self.payload.as_ref().map(Payload::checksum).unwrap_or(0);
        for child in self.children.values() {
            cs = combine(cs, child.calculate_checksum());
        }
        if let Some(index) = &self.index {
            for key in index {
                cs = combine(cs, str_checksum(key));
            }
        }
        cs
    }
}

fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

/// The session's node tree.
#[derive(Debug, Default)]
pub struct NodeStore {
    root: DataNode,
    /// Monotonic per-parent hints for [`Self::unused_node_id`].
    id_hints: HashMap<String, u32>,
}

impl NodeStore {
    /// Create an empty store (a bare session node).
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a node by exact session-relative path. The empty path is the
    /// session node itself.
    pub fn get(&self, path: &str) -> Option<&DataNode> {
        let mut cur = &self.root;
        for seg in segments(path) {
            cur = cur.children.get(seg)?;
        }
        Some(cur)
    }

    fn get_mut(&mut self, path: &str) -> Option<&mut DataNode> {
        let mut cur = &mut self.root;
        for seg in segments(path) {
            cur = cur.children.get_mut(seg)?;
        }
        Some(cur)
    }

    /// Set (or create) the node at `path`, creating missing interior nodes.
    ///
    /// `path` must be concrete (no wildcards) and session-relative. With
    /// [`StoreFlags::ADD_TO_INDEX`] the node is placed in its parent's
    /// index — before the sibling named by `insert_before` when that entry
    /// exists, else appended; re-adding an indexed name moves it.
    pub fn set_data_node(
        &mut self,
        path: &str,
        payload: Payload,
        flags: StoreFlags,
        insert_before: Option<&str>,
        events: &mut Vec<NodeEvent>,
    ) -> Result<()> {
        if is_wildcard(path) {
            return Err(Error::bad_argument(format!("wildcards not allowed in set: {path}")));
        }
        let segs: Vec<&str> = segments(path).collect();
        if segs.is_empty() && flags.contains(StoreFlags::ADD_TO_INDEX) {
            return Err(Error::bad_argument("session node cannot be indexed"));
        }
        let quiet = flags.contains(StoreFlags::QUIET);

        // Walk down, creating interior nodes as needed. Each creation is an
        // event of its own.
        let mut cur = &mut self.root;
        let mut cur_path = String::new();
        for (i, seg) in segs.iter().enumerate() {
            let child_path = join_path(&cur_path, seg);
            let is_leaf = i + 1 == segs.len();
            if !cur.children.contains_key(*seg) {
                cur.children.insert(seg.to_string(), DataNode::default());
                if !is_leaf {
                    events.push(NodeEvent::Updated {
                        path: child_path.clone(),
                        old_payload: None,
                        new_payload: None,
                        removed: false,
                        subtree_checksum: 0,
                        quiet,
                    });
                }
            }
            if is_leaf {
                let node = cur.children.get_mut(*seg).expect("just ensured");
                let old_payload = node.payload.replace(payload.clone());
                let payload_checksum = payload.checksum();
                events.push(NodeEvent::Updated {
                    path: child_path.clone(),
                    old_payload,
                    new_payload: Some(payload),
                    removed: false,
                    subtree_checksum: payload_checksum,
                    quiet,
                });
                if flags.contains(StoreFlags::ADD_TO_INDEX) {
                    Self::index_insert(cur, &cur_path, seg, insert_before, quiet, events);
                }
                return Ok(());
            }
            cur = cur.children.get_mut(*seg).expect("just ensured");
            cur_path = child_path;
        }

        // Empty path: update the session node's own payload.
        let old_payload = self.root.payload.replace(payload.clone());
        let payload_checksum = payload.checksum();
        events.push(NodeEvent::Updated {
            path: String::new(),
            old_payload,
            new_payload: Some(payload),
            removed: false,
            subtree_checksum: payload_checksum,
            quiet,
        });
        Ok(())
    }

    /// Insert `key` into `parent`'s index before `before` (append when
    /// absent or not found). Re-inserting moves the entry.
    fn index_insert(
        parent: &mut DataNode,
        parent_path: &str,
        key: &str,
        before: Option<&str>,
        quiet: bool,
        events: &mut Vec<NodeEvent>,
    ) {
        let index = parent.index.get_or_insert_with(Vec::new);
        if let Some(old_pos) = index.iter().position(|k| k == key) {
            index.remove(old_pos);
            events.push(NodeEvent::IndexChanged {
                path: parent_path.to_string(),
                op: IndexOp::Removed,
                position: old_pos as u32,
                key: key.to_string(),
                quiet,
            });
        }
        let pos = before
            .filter(|b| !b.is_empty())
            .and_then(|b| index.iter().position(|k| k == b))
            .unwrap_or(index.len());
        index.insert(pos, key.to_string());
        events.push(NodeEvent::IndexChanged {
            path: parent_path.to_string(),
            op: IndexOp::Inserted,
            position: pos as u32,
            key: key.to_string(),
            quiet,
        });
    }

    /// Remove every node matching `path` (wildcards allowed) for which
    /// `accept` returns true, together with all descendants. Missing
    /// matches are skipped silently.
    ///
    /// `accept` receives each candidate's session-relative path and node;
    /// the session passes the conjunction of the request filter and the
    /// owning database's safe-query check.
    pub fn remove_data_nodes(
        &mut self,
        path: &str,
        accept: &dyn Fn(&str, &DataNode) -> bool,
        quiet: bool,
        events: &mut Vec<NodeEvent>,
    ) -> Result<()> {
        let matches = self.resolve(path);
        for node_path in matches {
            // An earlier removal may have taken this one with it.
            let Some(node) = self.get(&node_path) else { continue };
            if !accept(&node_path, node) {
                continue;
            }
            self.remove_one(&node_path, quiet, events);
        }
        Ok(())
    }

    /// Unlink a single concrete node and its subtree, reporting children
    /// before parents.
    fn remove_one(&mut self, node_path: &str, quiet: bool, events: &mut Vec<NodeEvent>) {
        let segs: Vec<&str> = segments(node_path).collect();
        let Some((name, parent_segs)) = segs.split_last() else {
            // The session node itself: clear payload, children and index.
            // The id hints stay — allocation is monotonic across resets.
            let mut root = std::mem::take(&mut self.root);
            Self::tear_down_children(&mut root, "", quiet, events);
            events.push(NodeEvent::Updated {
                path: String::new(),
                old_payload: root.payload.clone(),
                new_payload: None,
                removed: true,
                subtree_checksum: root.calculate_checksum(),
                quiet,
            });
            return;
        };
        let parent_path = parent_segs.join("/");
        let Some(parent) = self.get_mut(&parent_path) else { return };
        let Some(mut node) = parent.children.remove(*name) else { return };
        if let Some(pos) = parent.index_position(name) {
            parent.index.as_mut().expect("position implies index").remove(pos);
            events.push(NodeEvent::IndexChanged {
                path: parent_path.clone(),
                op: IndexOp::Removed,
                position: pos as u32,
                key: name.to_string(),
                quiet,
            });
        }
        Self::tear_down_children(&mut node, node_path, quiet, events);
        events.push(NodeEvent::Updated {
            path: node_path.to_string(),
            old_payload: node.payload.clone(),
            new_payload: None,
            removed: true,
            subtree_checksum: node.calculate_checksum(),
            quiet,
        });
    }

    fn tear_down_children(node: &mut DataNode, node_path: &str, quiet: bool, events: &mut Vec<NodeEvent>) {
        let names: Vec<String> = node.children.keys().cloned().collect();
        for name in names {
            let Some(mut child) = node.children.remove(&name) else { continue };
            if let Some(pos) = node.index_position(&name) {
                node.index.as_mut().expect("position implies index").remove(pos);
                events.push(NodeEvent::IndexChanged {
                    path: node_path.to_string(),
                    op: IndexOp::Removed,
                    position: pos as u32,
                    key: name.clone(),
                    quiet,
                });
            }
            let child_path = join_path(node_path, &name);
            Self::tear_down_children(&mut child, &child_path, quiet, events);
            events.push(NodeEvent::Updated {
                path: child_path,
                old_payload: child.payload.clone(),
                new_payload: None,
                removed: true,
                subtree_checksum: child.calculate_checksum(),
                quiet,
            });
        }
    }

    /// Reorder index entries of every node matching `path` (wildcards
    /// allowed): entries whose child satisfies `accept` are moved, in their
    /// current relative order, to sit immediately before `before` (appended
    /// when `before` is absent or not in the index). Entries for missing
    /// children are skipped.
    pub fn move_index_entries(
        &mut self,
        path: &str,
        before: Option<&str>,
        accept: &dyn Fn(&str, &DataNode) -> bool,
        events: &mut Vec<NodeEvent>,
    ) -> Result<()> {
        for node_path in self.resolve(path) {
            let Some(node) = self.get(&node_path) else { continue };
            let Some(index) = node.index() else { continue };

            let moving: Vec<String> = index
                .iter()
                .filter(|key| {
                    node.child(key)
                        .is_some_and(|child| accept(&join_path(&node_path, key), child))
                })
                .cloned()
                .collect();
            if moving.is_empty() {
                continue;
            }
            let node = self.get_mut(&node_path).expect("resolved above");
            for key in moving {
                let index = node.index.as_mut().expect("checked above");
                let old_pos = index.iter().position(|k| *k == key).expect("listed above");
                index.remove(old_pos);
                events.push(NodeEvent::IndexChanged {
                    path: node_path.clone(),
                    op: IndexOp::Removed,
                    position: old_pos as u32,
                    key: key.clone(),
                    quiet: false,
                });
                let new_pos = before
                    .filter(|b| !b.is_empty())
                    .and_then(|b| index.iter().position(|k| k == b))
                    .unwrap_or(index.len());
                index.insert(new_pos, key.clone());
                events.push(NodeEvent::IndexChanged {
                    path: node_path.clone(),
                    op: IndexOp::Inserted,
                    position: new_pos as u32,
                    key,
                    quiet: false,
                });
            }
        }
        Ok(())
    }

    /// Junior replay primitive: insert `key` at `position` in the index of
    /// the node at `path` (clamped to the index length).
    pub fn insert_index_entry_at(
        &mut self,
        path: &str,
        position: u32,
        key: &str,
        events: &mut Vec<NodeEvent>,
    ) -> Result<()> {
        let node = self
            .get_mut(path)
            .ok_or_else(|| Error::DataNotFound(path.to_string()))?;
        let index = node.index.get_or_insert_with(Vec::new);
        let pos = (position as usize).min(index.len());
        index.insert(pos, key.to_string());
        events.push(NodeEvent::IndexChanged {
            path: path.to_string(),
            op: IndexOp::Inserted,
            position: pos as u32,
            key: key.to_string(),
            quiet: false,
        });
        Ok(())
    }

    /// Junior replay primitive: remove the index entry at `position` of the
    /// node at `path`.
    pub fn remove_index_entry_at(&mut self, path: &str, position: u32, events: &mut Vec<NodeEvent>) -> Result<()> {
        let node = self
            .get_mut(path)
            .ok_or_else(|| Error::DataNotFound(path.to_string()))?;
        let index = node
            .index
            .as_mut()
            .ok_or_else(|| Error::DataNotFound(format!("{path} has no index")))?;
        if (position as usize) >= index.len() {
            return Err(Error::DataNotFound(format!(
                "{path} index position {position} out of range"
            )));
        }
        let key = index.remove(position as usize);
        events.push(NodeEvent::IndexChanged {
            path: path.to_string(),
            op: IndexOp::Removed,
            position,
            key,
            quiet: false,
        });
        Ok(())
    }

    /// Expand a (possibly wildcarded) session-relative path into the
    /// concrete paths of currently existing matches.
    pub fn resolve(&self, path: &str) -> Vec<String> {
        if !is_wildcard(path) {
            return if self.get(path).is_some() {
                vec![path.to_string()]
            } else {
                Vec::new()
            };
        }
        let segs: Vec<&str> = segments(path).collect();
        let mut out = Vec::new();
        Self::resolve_into(&self.root, "", &segs, &mut out);
        out
    }

    fn resolve_into(node: &DataNode, node_path: &str, pattern: &[&str], out: &mut Vec<String>) {
        let Some((seg, rest)) = pattern.split_first() else {
            out.push(node_path.to_string());
            return;
        };
        if is_wildcard(seg) {
            for (name, child) in &node.children {
                if glob_match(seg, name) {
                    Self::resolve_into(child, &join_path(node_path, name), rest, out);
                }
            }
        } else if let Some(child) = node.children.get(*seg) {
            Self::resolve_into(child, &join_path(node_path, seg), rest, out);
        }
    }

    /// Smallest unused integer child name under `parent_path`, with a
    /// monotonic per-parent hint: the hint only moves forward, so a name
    /// freed by deletion is never handed out again. Both the bare and the
    /// "I"-prefixed spelling of a candidate count as used.
    pub fn unused_node_id(&mut self, parent_path: &str) -> u32 {
        let mut id = self.id_hints.get(parent_path).copied().unwrap_or(0);
        if let Some(parent) = self.get(parent_path) {
            while parent.children.contains_key(&id.to_string())
                || parent.children.contains_key(&format!("I{id}"))
            {
                id += 1;
            }
        }
        self.id_hints.insert(parent_path.to_string(), id + 1);
        id
    }

    /// Archive the subtree rooted at `path`. Returns `None` when the node
    /// does not exist.
    pub fn save_subtree(&self, path: &str) -> Option<NodeArchive> {
        self.get(path).map(DataNode::to_archive)
    }

    /// Restore an archived subtree at `path`, firing the same events a
    /// sequence of sets and index inserts would. Existing payloads are
    /// replaced and existing index entries are removed first so the
    /// restored index matches the archive exactly.
    pub fn restore_subtree(
        &mut self,
        path: &str,
        archive: &NodeArchive,
        quiet: bool,
        events: &mut Vec<NodeEvent>,
    ) -> Result<()> {
        if is_wildcard(path) {
            return Err(Error::bad_argument(format!("wildcards not allowed in restore: {path}")));
        }
        if let Some(payload) = &archive.payload {
            self.set_data_node(path, payload.clone(), StoreFlags::quiet_if(quiet), None, events)?;
        } else if self.get(path).is_none() && !path.is_empty() {
            // Interior archive node with no payload still needs to exist.
            let segs: Vec<&str> = segments(path).collect();
            let mut cur = &mut self.root;
            let mut cur_path = String::new();
            for seg in segs {
                let child_path = join_path(&cur_path, seg);
                if !cur.children.contains_key(seg) {
                    cur.children.insert(seg.to_string(), DataNode::default());
                    events.push(NodeEvent::Updated {
                        path: child_path.clone(),
                        old_payload: None,
                        new_payload: None,
                        removed: false,
                        subtree_checksum: 0,
                        quiet,
                    });
                }
                cur = cur.children.get_mut(seg).expect("just ensured");
                cur_path = child_path;
            }
        }

        for (name, child_archive) in &archive.children {
            self.restore_subtree(&join_path(path, name), child_archive, quiet, events)?;
        }

        // Reset the index to the archived order.
        let existing_entries = self
            .get(path)
            .and_then(|node| node.index())
            .map(|index| index.len())
            .unwrap_or(0);
        for _ in 0..existing_entries {
            self.remove_index_entry_at(path, 0, events)?;
        }
        if let Some(archived_index) = &archive.index {
            for (i, key) in archived_index.iter().enumerate() {
                self.insert_index_entry_at(path, i as u32, key, events)?;
            }
        }
        Ok(())
    }

    /// The session node.
    pub fn root(&self) -> &DataNode {
        &self.root
    }
}

impl StoreFlags {
    /// QUIET when `quiet` is true, empty otherwise.
    pub fn quiet_if(quiet: bool) -> Self {
        if quiet {
            StoreFlags::QUIET
        } else {
            StoreFlags::none()
        }
    }
}
