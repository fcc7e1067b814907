//! Shared test utilities for integration tests.
//!
//! This module provides:
//! - fast peer settings (high heartbeat rate, short startup grace)
//! - helpers to spawn peers on one in-memory mesh
//! - convergence polling between peers

use std::sync::Arc;
use std::time::{Duration, Instant};
use treemesh::transport::InMemoryMesh;
use treemesh::{MeshPeer, MeshPeerHandle, PeerSettings};

/// Settings tuned so membership timing completes in tens of
/// milliseconds.
pub fn fast_settings(system_name: &str) -> PeerSettings {
    let mut settings = PeerSettings::for_testing(system_name);
    settings.heartbeats_per_second = 50;
    settings.heartbeats_before_fully_attached = 2;
    settings.beacons_per_second = 25;
    settings
}

/// Spawn a peer on the mesh with the given settings.
pub fn spawn_peer(mesh: &InMemoryMesh, settings: PeerSettings) -> MeshPeerHandle {
    MeshPeer::spawn(settings, Arc::new(mesh.endpoint())).expect("spawn peer")
}

/// Wait until every peer reports the same (running == recomputed)
/// checksum and the same archive for `db_index`.
pub async fn wait_converged(peers: &[&MeshPeerHandle], db_index: u8, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        if check_converged(peers, db_index).await {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "peers failed to converge on db {db_index} within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

async fn check_converged(peers: &[&MeshPeerHandle], db_index: u8) -> bool {
    let mut reference: Option<(u32, treemesh::NodeArchive)> = None;
    for peer in peers {
        let client = peer.client();
        let Ok((running, recomputed)) = client.checksums(db_index).await else {
            return false;
        };
        if running != recomputed {
            return false;
        }
        let Ok(archive) = client.save_archive(db_index).await else {
            return false;
        };
        match &reference {
            None => reference = Some((running, archive)),
            Some((ref_cs, ref_archive)) => {
                if running != *ref_cs || archive != *ref_archive {
                    return false;
                }
            }
        }
    }
    true
}
