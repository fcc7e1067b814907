// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the mesh database.
//!
//! Every fallible operation in the crate returns one of these kinds.
//! Protocol violations (unknown opcodes, senior-only opcodes delivered to a
//! junior) are logged at error level and surfaced as ordinary errors — they
//! never unwind the peer. The receiving side reacts by requesting a resync.
//!
//! # Error Categories
//!
//! | Error Type | Resync | Description |
//! |------------|--------|-------------|
//! | `BadObject` | No | Operation on a database with no owning session |
//! | `BadArgument` | Yes* | Unknown path, missing payload, senior-only opcode on a junior |
//! | `DataNotFound` | Yes* | Index primitive addressed a missing node |
//! | `Unimplemented` | Yes* | Unknown message opcode |
//! | `TimedOut` | No | Client deadline expired before senior dispatch |
//! | `Io` | No | Transport send/receive failure |
//! | `Diverged` | Yes | Junior checksum disagrees with the senior's report |
//! | `Codec` | No | Wire encode/decode failure (malformed packet) |
//! | `Config` | No | Settings invalid (fix and restart) |
//! | `Shutdown` | No | Peer is shutting down |
//!
//! (*) when raised while replaying a senior-produced record: the junior's
//! state can no longer be trusted, so it requests a full resync.

use thiserror::Error;

/// Result type alias for mesh database operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while operating on or replicating a message tree.
#[derive(Error, Debug)]
pub enum Error {
    /// Operation attempted on a database that has no owning peer session.
    #[error("no owning peer session")]
    BadObject,

    /// Malformed request: unknown path, missing payload, or a senior-only
    /// opcode delivered to a junior peer.
    #[error("bad argument: {0}")]
    BadArgument(String),

    /// An index primitive addressed a node that does not exist.
    #[error("data not found: {0}")]
    DataNotFound(String),

    /// Unknown message opcode.
    #[error("unimplemented opcode {0:#010x}")]
    Unimplemented(u32),

    /// Client deadline expired before the command reached senior dispatch.
    /// The command was not applied.
    #[error("timed out")]
    TimedOut,

    /// Transport send or receive failure.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// A junior's running checksum disagrees with the senior's report.
    ///
    /// The junior marks itself unattached and requests a full archive.
    #[error("database {db_index} diverged at sequence {sequence}: local checksum {local:#010x}, senior reported {reported:#010x}")]
    Diverged {
        db_index: u8,
        sequence: u64,
        local: u32,
        reported: u32,
    },

    /// Wire encode/decode failure.
    #[error("codec error: {0}")]
    Codec(String),

    /// Invalid or inconsistent settings.
    #[error("configuration error: {0}")]
    Config(String),

    /// The peer is shutting down; the command was not applied.
    #[error("shutdown in progress")]
    Shutdown,
}

impl Error {
    /// Shorthand for a [`Error::BadArgument`] with a formatted message.
    pub fn bad_argument(msg: impl Into<String>) -> Self {
        Self::BadArgument(msg.into())
    }

    /// Shorthand for a [`Error::Codec`] with a formatted message.
    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }

    /// True if a junior encountering this error while replaying a
    /// senior-produced record should request a full resync.
    pub fn wants_resync(&self) -> bool {
        match self {
            Self::BadArgument(_) => true,
            Self::DataNotFound(_) => true,
            Self::Unimplemented(_) => true,
            Self::Diverged { .. } => true,
            Self::BadObject => false,
            Self::TimedOut => false,
            Self::Io(_) => false,
            Self::Codec(_) => false,
            Self::Config(_) => false,
            Self::Shutdown => false,
        }
    }

    /// True for divergence specifically (feeds the instability window).
    pub fn is_divergence(&self) -> bool {
        matches!(self, Self::Diverged { .. })
    }
}
