//! Discovery: system advertisements and client-side aggregation.
//!
//! Peers multicast a [`SystemAdvertisement`] describing their system and
//! its membership; operator tools listen and aggregate them into a
//! catalog, one entry per system name. Entries expire when no
//! advertisement refreshes them within the expiry window.
//!
//! The database count rides in every advertisement: a peer that sees its
//! own system name advertised with a different `num_databases` must
//! reject that peer (the session trees are incompatible).

use crate::wire::SystemAdvertisement;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// One aggregated system, for operator display.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemSummary {
    pub system_name: String,
    pub num_databases: u8,
    pub full_peers: usize,
    pub junior_peers: usize,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

struct CatalogEntry {
    advertisement: SystemAdvertisement,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    refreshed: Instant,
}

/// Aggregates advertisements per system name.
pub struct SystemCatalog {
    expiry: Duration,
    entries: HashMap<String, CatalogEntry>,
}

impl SystemCatalog {
    /// `expiry` is how long an entry survives without a refresh.
    pub fn new(expiry: Duration) -> Self {
        Self {
            expiry,
            entries: HashMap::new(),
        }
    }

    /// Default expiry: 5 seconds (a few advertisement periods).
    pub fn standard() -> Self {
        Self::new(Duration::from_secs(5))
    }

    /// Record an advertisement heard at `now`.
    pub fn observe(&mut self, advertisement: SystemAdvertisement, now: Instant) {
        crate::metrics::record_advertisement(&advertisement.system_name);
        let wall = Utc::now();
        self.entries
            .entry(advertisement.system_name.clone())
            .and_modify(|entry| {
                entry.advertisement = advertisement.clone();
                entry.last_seen = wall;
                entry.refreshed = now;
            })
            .or_insert(CatalogEntry {
                advertisement,
                first_seen: wall,
                last_seen: wall,
                refreshed: now,
            });
    }

    /// Drop entries that have not been refreshed within the expiry
    /// window.
    pub fn prune(&mut self, now: Instant) {
        let expiry = self.expiry;
        self.entries
            .retain(|_, entry| now.duration_since(entry.refreshed) <= expiry);
    }

    /// Current systems, sorted by name.
    pub fn systems(&self) -> Vec<SystemSummary> {
        let mut out: Vec<SystemSummary> = self
            .entries
            .values()
            .map(|entry| {
                let (full, junior) = entry.advertisement.peer_counts();
                SystemSummary {
                    system_name: entry.advertisement.system_name.clone(),
                    num_databases: entry.advertisement.num_databases,
                    full_peers: full,
                    junior_peers: junior,
                    first_seen: entry.first_seen,
                    last_seen: entry.last_seen,
                }
            })
            .collect();
        out.sort_by(|a, b| a.system_name.cmp(&b.system_name));
        out
    }

    /// Look up one system's latest advertisement.
    pub fn get(&self, system_name: &str) -> Option<&SystemAdvertisement> {
        self.entries.get(system_name).map(|e| &e.advertisement)
    }

    /// True when an advertisement is incompatible with local settings for
    /// the same system name.
    pub fn is_incompatible(advertisement: &SystemAdvertisement, local_name: &str, local_num_databases: u8) -> bool {
        advertisement.system_name == local_name && advertisement.num_databases != local_num_databases
    }
}
