// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Wire formats.
//!
//! All packets are postcard-encoded [`WirePacket`] variants. The stable
//! surface is:
//!
//! - **Heartbeat** `{peer_id, seq, peer_type, attrs_zlib, senior_opinion}`
//!   at the configured heartbeat rate. Attributes ride zlib-compressed;
//!   packets larger than [`MAX_DATAGRAM_BYTES`] are rejected at encode
//!   time rather than silently truncated by the network.
//! - **Beacon** `{peer_id, per_db: [{db_index, last_seq, checksum?}]}`,
//!   senior-only.
//! - **Advertisement** `{system_name, num_databases, peers}` for
//!   discovery.
//! - **Replication envelope** `{db_index, sequence, kind, body}` where
//!   `kind` is junior batch, full archive, or checksum report.
//!
//! Full-archive bodies are zstd-compressed when that helps (detected on
//! receipt by the zstd magic) and carry a SHA-256 content hash computed
//! over the uncompressed bytes — a truncated or corrupted transfer is
//! rejected before it can poison a junior's tree.

use crate::error::{Error, Result};
use crate::membership::PeerId;
use crate::message::UpdateMessage;
use crate::config::PeerType;
use crate::node::NodeArchive;
use crate::payload::Payload;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};

/// Largest datagram we are willing to emit for the periodic packet
/// streams (conservative Ethernet MTU minus headers).
pub const MAX_DATAGRAM_BYTES: usize = 1400;

/// zstd frame magic, used to detect compressed archive bodies.
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

// ═══════════════════════════════════════════════════════════════════════
// Heartbeat
// ═══════════════════════════════════════════════════════════════════════

/// Liveness and membership gossip, multicast by every attached peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPacket {
    pub peer_id: PeerId,
    /// Monotonic per-process packet counter.
    pub seq: u64,
    pub peer_type: PeerType,
    /// zlib-compressed flattened attributes payload, if any.
    pub attrs_zlib: Option<Vec<u8>>,
    /// The sender's current opinion of who the senior is.
    pub senior_opinion: Option<PeerId>,
}

impl HeartbeatPacket {
    /// Build a heartbeat, compressing the attributes payload.
    pub fn new(
        peer_id: PeerId,
        seq: u64,
        peer_type: PeerType,
        attributes: Option<&Payload>,
        senior_opinion: Option<PeerId>,
    ) -> Result<Self> {
        let attrs_zlib = match attributes {
            Some(p) => Some(zlib_compress(&p.flatten()?)?),
            None => None,
        };
        Ok(Self {
            peer_id,
            seq,
            peer_type,
            attrs_zlib,
            senior_opinion,
        })
    }

    /// Decompress and restore the attributes payload.
    pub fn attributes(&self) -> Result<Option<Payload>> {
        match &self.attrs_zlib {
            Some(compressed) => Ok(Some(Payload::unflatten(&zlib_decompress(compressed)?)?)),
            None => Ok(None),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Beacon
// ═══════════════════════════════════════════════════════════════════════

/// A checksum sample anchored to a replay sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumAt {
    pub sequence: u64,
    pub checksum: u32,
}

/// Per-database replay cursor in a beacon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconDbStatus {
    pub db_index: u8,
    /// Sequence of the last batch the senior published.
    pub last_seq: u64,
    /// Periodic checksum sample (every K batches).
    pub checksum: Option<ChecksumAt>,
}

/// Senior-only packet letting juniors detect missed updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeaconPacket {
    pub peer_id: PeerId,
    pub per_db: Vec<BeaconDbStatus>,
}

// ═══════════════════════════════════════════════════════════════════════
// Discovery advertisement
// ═══════════════════════════════════════════════════════════════════════

/// One peer entry in an advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisedPeer {
    pub peer_id: PeerId,
    pub peer_type: PeerType,
}

/// Multicast system advertisement aggregated by discovery clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemAdvertisement {
    pub system_name: String,
    /// Peers with the same name but a different database count reject
    /// each other; the count rides along so the check happens before any
    /// replication traffic.
    pub num_databases: u8,
    pub peers: Vec<AdvertisedPeer>,
}

impl SystemAdvertisement {
    /// Count of attached peers by type: `(full, junior_only)`.
    pub fn peer_counts(&self) -> (usize, usize) {
        self.peers.iter().fold((0, 0), |(f, j), p| match p.peer_type {
            PeerType::Full => (f + 1, j),
            PeerType::JuniorOnly => (f, j + 1),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Replication envelope
// ═══════════════════════════════════════════════════════════════════════

/// What a replication envelope carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeKind {
    /// A junior replay record (postcard [`UpdateMessage`]).
    JuniorBatch,
    /// A full database archive for catch-up.
    FullArchive,
    /// A standalone checksum report.
    ChecksumReport,
}

/// A sequenced, per-database replication record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationEnvelope {
    pub db_index: u8,
    pub sequence: u64,
    pub kind: EnvelopeKind,
    pub body: Vec<u8>,
}

/// Archive body: content hash over the uncompressed archive bytes plus
/// the (possibly zstd-compressed) bytes themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ArchiveBody {
    content_hash: [u8; 32],
    data: Vec<u8>,
}

impl ReplicationEnvelope {
    /// Wrap a junior replay record.
    pub fn junior_batch(db_index: u8, sequence: u64, msg: &UpdateMessage) -> Result<Self> {
        Ok(Self {
            db_index,
            sequence,
            kind: EnvelopeKind::JuniorBatch,
            body: postcard::to_allocvec(msg).map_err(|e| Error::codec(format!("junior batch encode: {e}")))?,
        })
    }

    /// Decode a junior replay record.
    pub fn decode_junior_batch(&self) -> Result<UpdateMessage> {
        if self.kind != EnvelopeKind::JuniorBatch {
            return Err(Error::codec("not a junior batch envelope"));
        }
        postcard::from_bytes(&self.body).map_err(|e| Error::codec(format!("junior batch decode: {e}")))
    }

    /// Wrap a full archive. `sequence` is the replay cursor the receiver
    /// resumes from after restoring.
    pub fn full_archive(db_index: u8, sequence: u64, archive: &NodeArchive) -> Result<Self> {
        let raw = postcard::to_allocvec(archive).map_err(|e| Error::codec(format!("archive encode: {e}")))?;
        let content_hash: [u8; 32] = Sha256::digest(&raw).into();
        let compressed = zstd::encode_all(raw.as_slice(), 3)
            .map_err(|e| Error::codec(format!("archive compress: {e}")))?;
        // Small archives can compress larger; ship whichever is smaller
        // and let the magic bytes tell them apart.
        let data = if compressed.len() < raw.len() { compressed } else { raw };
        let body = postcard::to_allocvec(&ArchiveBody { content_hash, data })
            .map_err(|e| Error::codec(format!("archive body encode: {e}")))?;
        Ok(Self {
            db_index,
            sequence,
            kind: EnvelopeKind::FullArchive,
            body,
        })
    }

    /// Decode and verify a full archive.
    pub fn decode_full_archive(&self) -> Result<NodeArchive> {
        if self.kind != EnvelopeKind::FullArchive {
            return Err(Error::codec("not a full archive envelope"));
        }
        let body: ArchiveBody =
            postcard::from_bytes(&self.body).map_err(|e| Error::codec(format!("archive body decode: {e}")))?;
        let raw = maybe_decompress(&body.data)?;
        let actual: [u8; 32] = Sha256::digest(&raw).into();
        if actual != body.content_hash {
            return Err(Error::codec("archive content hash mismatch"));
        }
        postcard::from_bytes(&raw).map_err(|e| Error::codec(format!("archive decode: {e}")))
    }

    /// Wrap a standalone checksum report.
    pub fn checksum_report(db_index: u8, sequence: u64, checksum: u32) -> Result<Self> {
        Ok(Self {
            db_index,
            sequence,
            kind: EnvelopeKind::ChecksumReport,
            body: postcard::to_allocvec(&checksum).map_err(|e| Error::codec(format!("report encode: {e}")))?,
        })
    }

    /// Decode a checksum report body.
    pub fn decode_checksum_report(&self) -> Result<u32> {
        if self.kind != EnvelopeKind::ChecksumReport {
            return Err(Error::codec("not a checksum report envelope"));
        }
        postcard::from_bytes(&self.body).map_err(|e| Error::codec(format!("report decode: {e}")))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Top-level packet
// ═══════════════════════════════════════════════════════════════════════

/// Everything that travels between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WirePacket {
    Heartbeat(HeartbeatPacket),
    Beacon(BeaconPacket),
    Advertisement(SystemAdvertisement),
    Replication(ReplicationEnvelope),
    /// A client mutation forwarded from a junior to the senior.
    SeniorRequest {
        from: PeerId,
        db_index: u8,
        message: UpdateMessage,
    },
    /// A junior asking the senior to re-serve missed sequences (or a full
    /// archive when the gap is too old for the replay log).
    CatchUpRequest {
        from: PeerId,
        db_index: u8,
        from_sequence: u64,
        want_full: bool,
    },
}

/// Encode a packet for the wire.
pub fn encode_packet(packet: &WirePacket) -> Result<Vec<u8>> {
    let bytes = postcard::to_allocvec(packet).map_err(|e| Error::codec(format!("packet encode: {e}")))?;
    // Only the periodic gossip streams are MTU-bounded; replication
    // envelopes ride the reliable channel.
    match packet {
        WirePacket::Heartbeat(_) | WirePacket::Beacon(_) | WirePacket::Advertisement(_)
            if bytes.len() > MAX_DATAGRAM_BYTES =>
        {
            Err(Error::bad_argument(format!(
                "packet of {} bytes exceeds the {} byte datagram limit",
                bytes.len(),
                MAX_DATAGRAM_BYTES
            )))
        }
        _ => Ok(bytes),
    }
}

/// Decode a packet from the wire.
pub fn decode_packet(bytes: &[u8]) -> Result<WirePacket> {
    postcard::from_bytes(bytes).map_err(|e| Error::codec(format!("packet decode: {e}")))
}

// ═══════════════════════════════════════════════════════════════════════
// Compression helpers
// ═══════════════════════════════════════════════════════════════════════

fn zlib_compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn zlib_decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = flate2::read::ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::codec(format!("zlib decode: {e}")))?;
    Ok(out)
}

/// Decompress zstd data if it has the magic header, otherwise return it
/// as-is.
pub fn maybe_decompress(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() >= 4 && data[..4] == ZSTD_MAGIC {
        let mut decoder =
            zstd::Decoder::new(data).map_err(|e| Error::codec(format!("zstd init: {e}")))?;
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| Error::codec(format!("zstd decode: {e}")))?;
        Ok(out)
    } else {
        Ok(data.to_vec())
    }
}
