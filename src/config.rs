//! Peer settings.
//!
//! [`PeerSettings`] is the immutable bundle of knobs a peer is constructed
//! with. Settings never change during the lifetime of a peer — timing
//! values in particular are shared contracts: every peer in a system must
//! use the same `heartbeats_per_second`, and two peers advertising the same
//! system name with different `num_databases` refuse to talk to each other.
//!
//! Settings can be built programmatically or deserialized from JSON/YAML.
//!
//! # Example
//!
//! ```rust
//! use treemesh::config::{PeerSettings, PeerType};
//!
//! let settings = PeerSettings {
//!     system_name: "fridge".into(),
//!     num_databases: 2,
//!     ..PeerSettings::default()
//! };
//! assert_eq!(settings.peer_type, PeerType::Full);
//! assert_eq!(settings.database_root(0), "dbs/db_0");
//! ```

use crate::error::{Error, Result};
use crate::payload::Payload;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Whether a peer is willing to take on senior duties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PeerType {
    /// Eligible to be elected senior.
    Full,
    /// Follows as a junior only; never becomes senior.
    JuniorOnly,
}

impl std::fmt::Display for PeerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerType::Full => write!(f, "full"),
            PeerType::JuniorOnly => write!(f, "junior-only"),
        }
    }
}

/// Immutable per-peer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSettings {
    /// Name of the system this peer participates in. All peers in a system
    /// use the same name.
    pub system_name: String,

    /// Number of replicated databases the system maintains.
    #[serde(default = "default_num_databases")]
    pub num_databases: u8,

    /// Restrict multicast to loopback interfaces (single-host systems).
    #[serde(default)]
    pub localhost_only: bool,

    /// Senior eligibility.
    #[serde(default = "default_peer_type")]
    pub peer_type: PeerType,

    /// Small descriptive attributes gossiped (compressed) in every
    /// heartbeat. Keep this small — it rides in every packet.
    #[serde(default)]
    pub peer_attributes: Option<Payload>,

    /// Heartbeats sent per second; also the rate expected from every other
    /// peer. 0 is treated as 1.
    #[serde(default = "default_heartbeats_per_second")]
    pub heartbeats_per_second: u32,

    /// Heartbeat periods to listen passively at startup before announcing
    /// ourselves attached.
    #[serde(default = "default_heartbeats_before_fully_attached")]
    pub heartbeats_before_fully_attached: u32,

    /// Heartbeat periods of silence before a peer is declared offline.
    #[serde(default = "default_max_missing_heartbeats")]
    pub max_missing_heartbeats: u32,

    /// Beacon packets per second (sent only while senior).
    #[serde(default = "default_beacons_per_second")]
    pub beacons_per_second: u32,

    /// Per-database override of the replay-log RAM budget in bytes.
    /// Databases not listed use [`DEFAULT_UPDATE_LOG_BYTES`].
    #[serde(default)]
    pub max_update_log_bytes: HashMap<u8, u64>,

    /// Batches between checksum triples in the beacon stream. `None` means
    /// once per `beacons_per_second` batches.
    #[serde(default)]
    pub checksum_interval_batches: Option<u32>,

    /// Default client-command deadline as a duration string (e.g. "5s").
    #[serde(default = "default_command_timeout")]
    pub command_timeout: String,

    /// Explicit database root paths (session-relative). Databases beyond
    /// the list fall back to `dbs/db_<i>`.
    #[serde(default)]
    pub database_roots: Vec<String>,
}

/// Default replay-log budget per database: 2 MiB.
pub const DEFAULT_UPDATE_LOG_BYTES: u64 = 2 * 1024 * 1024;

fn default_num_databases() -> u8 {
    1
}

fn default_peer_type() -> PeerType {
    PeerType::Full
}

fn default_heartbeats_per_second() -> u32 {
    // Staying above 5 Hz avoids WiFi power-save idle detection kicking in
    // between packets on some platforms.
    6
}

fn default_heartbeats_before_fully_attached() -> u32 {
    4
}

fn default_max_missing_heartbeats() -> u32 {
    4
}

fn default_beacons_per_second() -> u32 {
    4
}

fn default_command_timeout() -> String {
    "5s".to_string()
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            system_name: "default".to_string(),
            num_databases: 1,
            localhost_only: false,
            peer_type: PeerType::Full,
            peer_attributes: None,
            heartbeats_per_second: 6,
            heartbeats_before_fully_attached: 4,
            max_missing_heartbeats: 4,
            beacons_per_second: 4,
            max_update_log_bytes: HashMap::new(),
            checksum_interval_batches: None,
            command_timeout: "5s".to_string(),
            database_roots: Vec::new(),
        }
    }
}

impl PeerSettings {
    /// Minimal settings for tests: one database, loopback only, fast
    /// heartbeats so membership timing tests stay quick.
    pub fn for_testing(system_name: &str) -> Self {
        Self {
            system_name: system_name.to_string(),
            localhost_only: true,
            heartbeats_per_second: 20,
            ..Default::default()
        }
    }

    /// Validate the settings bundle.
    pub fn validate(&self) -> Result<()> {
        if self.system_name.is_empty() {
            return Err(Error::Config("system_name must not be empty".into()));
        }
        if self.num_databases == 0 {
            return Err(Error::Config("num_databases must be at least 1".into()));
        }
        if self.database_roots.len() > self.num_databases as usize {
            return Err(Error::Config(format!(
                "{} database roots configured for {} databases",
                self.database_roots.len(),
                self.num_databases
            )));
        }
        Ok(())
    }

    /// Session-relative root path of database `index`.
    pub fn database_root(&self, index: u8) -> String {
        self.database_roots
            .get(index as usize)
            .cloned()
            .unwrap_or_else(|| format!("dbs/db_{index}"))
    }

    /// Interval between heartbeats. A configured rate of 0 acts as 1.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.heartbeats_per_second.max(1) as f64)
    }

    /// Interval between beacons (senior only).
    pub fn beacon_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.beacons_per_second.max(1) as f64)
    }

    /// Silence after which a peer is declared offline.
    pub fn offline_timeout(&self) -> Duration {
        self.heartbeat_interval() * self.max_missing_heartbeats.max(1)
    }

    /// Passive listening phase after startup.
    pub fn startup_grace(&self) -> Duration {
        self.heartbeat_interval() * self.heartbeats_before_fully_attached
    }

    /// Replay-log RAM budget for database `index`.
    pub fn update_log_budget(&self, index: u8) -> u64 {
        self.max_update_log_bytes
            .get(&index)
            .copied()
            .unwrap_or(DEFAULT_UPDATE_LOG_BYTES)
    }

    /// Batches between checksum triples in the beacon stream.
    pub fn checksum_interval(&self) -> u32 {
        self.checksum_interval_batches
            .unwrap_or(self.beacons_per_second)
            .max(1)
    }

    /// Parsed default client-command deadline.
    pub fn command_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.command_timeout).unwrap_or(Duration::from_secs(5))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = PeerSettings::default();
        assert_eq!(s.num_databases, 1);
        assert_eq!(s.peer_type, PeerType::Full);
        assert_eq!(s.heartbeats_per_second, 6);
        assert_eq!(s.heartbeats_before_fully_attached, 4);
        assert_eq!(s.max_missing_heartbeats, 4);
        assert_eq!(s.beacons_per_second, 4);
        assert!(!s.localhost_only);
    }

    #[test]
    fn test_database_root_fallback_and_override() {
        let mut s = PeerSettings::default();
        s.num_databases = 3;
        s.database_roots = vec!["magnets".to_string()];
        assert_eq!(s.database_root(0), "magnets");
        assert_eq!(s.database_root(1), "dbs/db_1");
        assert_eq!(s.database_root(2), "dbs/db_2");
    }

    #[test]
    fn test_derived_intervals() {
        let mut s = PeerSettings::default();
        s.heartbeats_per_second = 4;
        s.max_missing_heartbeats = 4;
        assert_eq!(s.heartbeat_interval(), Duration::from_millis(250));
        assert_eq!(s.offline_timeout(), Duration::from_secs(1));
        assert_eq!(s.startup_grace(), Duration::from_secs(1));

        // Zero rate acts as one per second.
        s.heartbeats_per_second = 0;
        assert_eq!(s.heartbeat_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_update_log_budget() {
        let mut s = PeerSettings::default();
        assert_eq!(s.update_log_budget(0), DEFAULT_UPDATE_LOG_BYTES);
        s.max_update_log_bytes.insert(1, 4096);
        assert_eq!(s.update_log_budget(1), 4096);
        assert_eq!(s.update_log_budget(0), DEFAULT_UPDATE_LOG_BYTES);
    }

    #[test]
    fn test_checksum_interval_default_tracks_beacon_rate() {
        let mut s = PeerSettings::default();
        assert_eq!(s.checksum_interval(), 4);
        s.checksum_interval_batches = Some(16);
        assert_eq!(s.checksum_interval(), 16);
        s.checksum_interval_batches = Some(0);
        assert_eq!(s.checksum_interval(), 1);
    }

    #[test]
    fn test_command_timeout_parsing() {
        let mut s = PeerSettings::default();
        assert_eq!(s.command_timeout_duration(), Duration::from_secs(5));
        s.command_timeout = "250ms".to_string();
        assert_eq!(s.command_timeout_duration(), Duration::from_millis(250));
        s.command_timeout = "garbage".to_string();
        assert_eq!(s.command_timeout_duration(), Duration::from_secs(5));
    }

    #[test]
    fn test_validate() {
        assert!(PeerSettings::default().validate().is_ok());

        let mut bad = PeerSettings::default();
        bad.system_name.clear();
        assert!(bad.validate().is_err());

        let mut bad = PeerSettings::default();
        bad.num_databases = 0;
        assert!(bad.validate().is_err());

        let mut bad = PeerSettings::default();
        bad.database_roots = vec!["a".into(), "b".into()];
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_json_roundtrip() {
        let mut s = PeerSettings::for_testing("roundtrip");
        s.max_update_log_bytes.insert(0, 1024);
        let json = serde_json::to_string(&s).unwrap();
        let parsed: PeerSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.system_name, "roundtrip");
        assert_eq!(parsed.update_log_budget(0), 1024);
        assert!(parsed.localhost_only);
    }
}
