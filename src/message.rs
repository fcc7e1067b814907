// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Update-message taxonomy.
//!
//! Every mutation travels as an [`UpdateMessage`]: a `what` opcode plus a
//! small set of named fields. The same shape is used for client requests
//! submitted to the senior and for the replay records the senior assembles
//! for juniors — the difference is which opcodes are legal in each
//! direction:
//!
//! - shared (senior & junior): `NOOP`, `UPDATE_NODE_VALUE`,
//!   `UPDATE_SUBTREE`, `INSERT_INDEX_ENTRY`, `REMOVE_INDEX_ENTRY`
//! - senior-only requests: `REQUEST_DELETE_NODES`, `MOVE_INDEX_ENTRY`,
//!   `REQUEST_UNDO`, `REQUEST_REDO` — a junior receiving one of these is a
//!   protocol error
//! - `BATCH` carries an ordered list of sub-messages and may nest
//!
//! Opcode values are stable wire constants. Field tags (`pth`, `pay`,
//! `flg`, `be4`, `fil`, `idx`, `key`) are fixed spellings used wherever a
//! named encoding is produced (e.g. JSON dumps from the operator CLI).

use crate::filter::NodeFilter;
use crate::node::NodeArchive;
use crate::payload::Payload;
use serde::{Deserialize, Serialize};

/// Stable `what` opcodes.
pub mod codes {
    /// Shared no-op; also the replay record substituted for an update with
    /// no observable effect.
    pub const NOOP: u32 = u32::from_be_bytes(*b"mtcc");
    /// Set or remove one node's payload.
    pub const UPDATE_NODE_VALUE: u32 = NOOP + 1;
    /// Replace a whole subtree from an archive.
    pub const UPDATE_SUBTREE: u32 = NOOP + 2;
    /// Positional index insert (junior replay primitive).
    pub const INSERT_INDEX_ENTRY: u32 = NOOP + 3;
    /// Positional index removal (junior replay primitive).
    pub const REMOVE_INDEX_ENTRY: u32 = NOOP + 4;

    /// Filtered recursive delete. Senior-only.
    pub const REQUEST_DELETE_NODES: u32 = u32::from_be_bytes(*b"mtsc");
    /// Filtered index reorder. Senior-only.
    pub const MOVE_INDEX_ENTRY: u32 = REQUEST_DELETE_NODES + 1;

    /// Ordered list of sub-messages; may nest.
    pub const BATCH: u32 = u32::from_be_bytes(*b"mtbt");

    /// Undo the most recent operation matching a pattern. Senior-only.
    pub const REQUEST_UNDO: u32 = u32::from_be_bytes(*b"mtud");
    /// Redo the most recently undone operation. Senior-only.
    pub const REQUEST_REDO: u32 = u32::from_be_bytes(*b"mtrd");
}

/// True for opcodes that only the senior may execute.
pub fn is_senior_only(what: u32) -> bool {
    matches!(
        what,
        codes::REQUEST_DELETE_NODES
            | codes::MOVE_INDEX_ENTRY
            | codes::REQUEST_UNDO
            | codes::REQUEST_REDO
    )
}

/// Human-readable opcode name for logs.
pub fn code_name(what: u32) -> &'static str {
    match what {
        codes::NOOP => "NOOP",
        codes::UPDATE_NODE_VALUE => "UPDATE_NODE_VALUE",
        codes::UPDATE_SUBTREE => "UPDATE_SUBTREE",
        codes::INSERT_INDEX_ENTRY => "INSERT_INDEX_ENTRY",
        codes::REMOVE_INDEX_ENTRY => "REMOVE_INDEX_ENTRY",
        codes::REQUEST_DELETE_NODES => "REQUEST_DELETE_NODES",
        codes::MOVE_INDEX_ENTRY => "MOVE_INDEX_ENTRY",
        codes::BATCH => "BATCH",
        codes::REQUEST_UNDO => "REQUEST_UNDO",
        codes::REQUEST_REDO => "REQUEST_REDO",
        _ => "UNKNOWN",
    }
}

/// Per-message flag bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TreeFlags(u32);

impl TreeFlags {
    /// Suppress the local subscriber notification of the requester on the
    /// peer that processed the original request.
    pub const NOREPLY: TreeFlags = TreeFlags(1 << 0);
    /// Place the child in its parent's ordered index.
    pub const INDEXED: TreeFlags = TreeFlags(1 << 1);
    /// Coalescable update: juniors may drop it if a newer non-interim
    /// record supersedes it. The running checksum still tracks it.
    pub const INTERIM: TreeFlags = TreeFlags(1 << 2);

    /// The empty flag set.
    pub fn none() -> Self {
        TreeFlags(0)
    }

    /// Union of two flag sets.
    pub fn with(self, other: TreeFlags) -> Self {
        TreeFlags(self.0 | other.0)
    }

    /// True if every bit of `other` is set.
    pub fn contains(self, other: TreeFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// A single update message.
///
/// Unused fields are `None` / empty; which fields are meaningful depends on
/// `what` (see the senior/junior dispatch in the session module).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateMessage {
    pub what: u32,
    #[serde(rename = "pth")]
    pub path: Option<String>,
    #[serde(rename = "pay")]
    pub payload: Option<Payload>,
    #[serde(rename = "flg")]
    pub flags: TreeFlags,
    #[serde(rename = "be4")]
    pub before: Option<String>,
    #[serde(rename = "fil")]
    pub filter: Option<NodeFilter>,
    #[serde(rename = "idx")]
    pub index: Option<u32>,
    #[serde(rename = "key")]
    pub key: Option<String>,
    /// Archived subtree, for `UPDATE_SUBTREE`.
    pub subtree: Option<NodeArchive>,
    /// Ordered children, for `BATCH`.
    pub sub_messages: Vec<UpdateMessage>,
}

impl UpdateMessage {
    /// The shared no-op message.
    pub fn noop() -> Self {
        UpdateMessage {
            what: codes::NOOP,
            ..Default::default()
        }
    }

    /// Build an `UPDATE_NODE_VALUE` message. A `None` payload requests
    /// removal of the node (and its descendants).
    pub fn node_update(
        path: impl Into<String>,
        payload: Option<Payload>,
        flags: TreeFlags,
        before: Option<String>,
    ) -> Self {
        UpdateMessage {
            what: codes::UPDATE_NODE_VALUE,
            path: Some(path.into()),
            payload,
            flags,
            before,
            ..Default::default()
        }
    }

    /// Build an `UPDATE_SUBTREE` message.
    pub fn subtree_update(path: impl Into<String>, subtree: NodeArchive, flags: TreeFlags) -> Self {
        UpdateMessage {
            what: codes::UPDATE_SUBTREE,
            path: Some(path.into()),
            flags,
            subtree: Some(subtree),
            ..Default::default()
        }
    }

    /// Build an `INSERT_INDEX_ENTRY` or `REMOVE_INDEX_ENTRY` message.
    pub fn index_update(what: u32, path: impl Into<String>, index: u32, key: impl Into<String>) -> Self {
        debug_assert!(what == codes::INSERT_INDEX_ENTRY || what == codes::REMOVE_INDEX_ENTRY);
        UpdateMessage {
            what,
            path: Some(path.into()),
            index: Some(index),
            key: Some(key.into()),
            ..Default::default()
        }
    }

    /// Build a senior-only `REQUEST_DELETE_NODES` message.
    pub fn delete_request(path: impl Into<String>, filter: Option<NodeFilter>, flags: TreeFlags) -> Self {
        UpdateMessage {
            what: codes::REQUEST_DELETE_NODES,
            path: Some(path.into()),
            flags,
            filter,
            ..Default::default()
        }
    }

    /// Build a senior-only `MOVE_INDEX_ENTRY` message.
    pub fn move_index_request(
        path: impl Into<String>,
        before: Option<String>,
        filter: Option<NodeFilter>,
        flags: TreeFlags,
    ) -> Self {
        UpdateMessage {
            what: codes::MOVE_INDEX_ENTRY,
            path: Some(path.into()),
            flags,
            before,
            filter,
            ..Default::default()
        }
    }

    /// Build a senior-only undo/redo request carrying a pattern string.
    pub fn undo_request(what: u32, pattern: impl Into<String>) -> Self {
        debug_assert!(what == codes::REQUEST_UNDO || what == codes::REQUEST_REDO);
        UpdateMessage {
            what,
            key: Some(pattern.into()),
            ..Default::default()
        }
    }

    /// Build a `BATCH` from an ordered list of sub-messages.
    pub fn batch(sub_messages: Vec<UpdateMessage>) -> Self {
        UpdateMessage {
            what: codes::BATCH,
            sub_messages,
            ..Default::default()
        }
    }

    /// True if the message is a bare NOOP.
    pub fn is_noop(&self) -> bool {
        self.what == codes::NOOP
    }

    /// Path field or the empty string.
    pub fn path_or_empty(&self) -> &str {
        self.path.as_deref().unwrap_or("")
    }

    /// Append to a batch being assembled.
    ///
    /// The first record becomes the assembled message itself; a second
    /// record promotes it to a `BATCH`; further records are appended. This
    /// keeps the single-record case (by far the most common) free of the
    /// envelope.
    pub fn append_to_batch(assembling: &mut Option<UpdateMessage>, msg: UpdateMessage) {
        match assembling.take() {
            None => *assembling = Some(msg),
            Some(existing) if existing.what == codes::BATCH => {
                let mut batch = existing;
                batch.sub_messages.push(msg);
                *assembling = Some(batch);
            }
            Some(existing) => *assembling = Some(UpdateMessage::batch(vec![existing, msg])),
        }
    }
}
