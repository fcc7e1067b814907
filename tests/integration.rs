// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! End-to-end replication tests over the in-memory mesh.
//!
//! These run whole peers — session, membership, election, replication —
//! against each other in one process, with no network or containers.
//!
//! # Test Organization
//! - `replication_*` - senior/junior convergence on live mutations
//! - `catchup_*` - late join, archive restore, divergence recovery
//! - `election_*` - senior failover and role changes

mod common;

use common::{fast_settings, spawn_peer, wait_converged};
use std::sync::Arc;
use std::time::Duration;
use treemesh::coordinator::PeerRole;
use treemesh::transport::{InMemoryMesh, Transport};
use treemesh::wire::{ReplicationEnvelope, WirePacket};
use treemesh::{NodeFilter, Payload, PeerSettings, TreeFlags};

const CONVERGE: Duration = Duration::from_secs(10);

fn magnet(colour: &str) -> Payload {
    let mut p = Payload::new();
    p.put_str("colour", colour);
    p
}

fn magnets_settings(system: &str) -> PeerSettings {
    let mut settings = fast_settings(system);
    settings.database_roots = vec!["magnets".to_string()];
    settings
}

// =============================================================================
// Replication
// =============================================================================

#[tokio::test]
async fn replication_two_peers_converge_on_inserts() {
    let mesh = InMemoryMesh::new();
    let a = spawn_peer(&mesh, magnets_settings("pair"));
    a.wait_for(|h| h.role == PeerRole::Senior, CONVERGE).await.unwrap();
    let b = spawn_peer(&mesh, magnets_settings("pair"));
    b.wait_for(|h| h.ready() && h.senior.is_some(), CONVERGE).await.unwrap();

    let client = a.client();
    for colour in ["red", "green", "blue"] {
        client
            .upload_node_value(
                format!("magnets/{colour}"),
                Some(magnet(colour)),
                TreeFlags::none(),
                None,
            )
            .await
            .unwrap();
    }

    wait_converged(&[&a, &b], 0, CONVERGE).await;
    let archive = a.client().save_archive(0).await.unwrap();
    assert_eq!(archive.children.len(), 3);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn replication_indexed_allocation_matches_on_junior() {
    let mesh = InMemoryMesh::new();
    let a = spawn_peer(&mesh, magnets_settings("indexed"));
    a.wait_for(|h| h.role == PeerRole::Senior, CONVERGE).await.unwrap();
    let b = spawn_peer(&mesh, magnets_settings("indexed"));
    b.wait_for(|h| h.ready() && h.senior.is_some(), CONVERGE).await.unwrap();

    // Trailing slash: the senior allocates I0, I1, I2.
    let client = a.client();
    for colour in ["red", "green", "blue"] {
        client
            .upload_node_value("magnets/", Some(magnet(colour)), TreeFlags::INDEXED, None)
            .await
            .unwrap();
    }

    wait_converged(&[&a, &b], 0, CONVERGE).await;
    let archive = b.client().save_archive(0).await.unwrap();
    assert_eq!(archive.index.as_deref(), Some(&["I0".to_string(), "I1".into(), "I2".into()][..]));

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn replication_junior_command_forwarded_to_senior() {
    let mesh = InMemoryMesh::new();
    let a = spawn_peer(&mesh, magnets_settings("forward"));
    a.wait_for(|h| h.role == PeerRole::Senior, CONVERGE).await.unwrap();
    let b = spawn_peer(&mesh, magnets_settings("forward"));
    b.wait_for(|h| h.ready() && h.senior.is_some(), CONVERGE).await.unwrap();

    // Whichever peer is currently junior submits through forwarding.
    let junior = if a.health().role == PeerRole::Senior { &b } else { &a };
    junior
        .client()
        .upload_node_value("magnets/note", Some(magnet("white")), TreeFlags::none(), None)
        .await
        .unwrap();

    wait_converged(&[&a, &b], 0, CONVERGE).await;
    let archive = a.client().save_archive(0).await.unwrap();
    assert!(archive.children.contains_key("note"));

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn replication_filter_scoped_delete_leaves_other_database() {
    let mesh = InMemoryMesh::new();
    let mut settings = fast_settings("twodb");
    settings.num_databases = 2;
    settings.database_roots = vec!["a".to_string(), "b".to_string()];

    let senior = spawn_peer(&mesh, settings.clone());
    senior.wait_for(|h| h.role == PeerRole::Senior, CONVERGE).await.unwrap();
    let junior = spawn_peer(&mesh, settings);
    junior.wait_for(|h| h.ready() && h.senior.is_some(), CONVERGE).await.unwrap();

    let client = senior.client();
    client
        .upload_node_value("a/x", Some(magnet("ax")), TreeFlags::none(), None)
        .await
        .unwrap();
    client
        .upload_node_value("b/x", Some(magnet("bx")), TreeFlags::none(), None)
        .await
        .unwrap();

    // Wildcard delete routed to database A.
    client
        .request_delete_nodes("a/*", Some(NodeFilter::All), TreeFlags::none())
        .await
        .unwrap();

    wait_converged(&[&senior, &junior], 0, CONVERGE).await;
    wait_converged(&[&senior, &junior], 1, CONVERGE).await;

    let db_a = junior.client().save_archive(0).await.unwrap();
    let db_b = junior.client().save_archive(1).await.unwrap();
    assert!(db_a.children.is_empty());
    assert!(db_b.children.contains_key("x"));

    senior.shutdown().await;
    junior.shutdown().await;
}

#[tokio::test]
async fn replication_interim_updates_converge_to_last_value() {
    let mesh = InMemoryMesh::new();
    let a = spawn_peer(&mesh, magnets_settings("interim"));
    a.wait_for(|h| h.role == PeerRole::Senior, CONVERGE).await.unwrap();
    let b = spawn_peer(&mesh, magnets_settings("interim"));
    b.wait_for(|h| h.ready() && h.senior.is_some(), CONVERGE).await.unwrap();

    let client = a.client();
    for i in 0..5 {
        client
            .upload_node_value(
                "magnets/drag",
                Some(magnet(&format!("step-{i}"))),
                TreeFlags::INTERIM,
                None,
            )
            .await
            .unwrap();
    }

    wait_converged(&[&a, &b], 0, CONVERGE).await;
    let archive = b.client().save_archive(0).await.unwrap();
    let payload = archive.children["drag"].payload.as_ref().unwrap();
    assert_eq!(payload.get_str("colour"), Some("step-4"));

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn replication_remove_subtree_replays() {
    let mesh = InMemoryMesh::new();
    let a = spawn_peer(&mesh, magnets_settings("remove"));
    a.wait_for(|h| h.role == PeerRole::Senior, CONVERGE).await.unwrap();
    let b = spawn_peer(&mesh, magnets_settings("remove"));
    b.wait_for(|h| h.ready() && h.senior.is_some(), CONVERGE).await.unwrap();

    let client = a.client();
    client
        .upload_node_value("magnets/shelf/top", Some(magnet("t")), TreeFlags::none(), None)
        .await
        .unwrap();
    client
        .upload_node_value("magnets/shelf/bottom", Some(magnet("b")), TreeFlags::none(), None)
        .await
        .unwrap();
    wait_converged(&[&a, &b], 0, CONVERGE).await;

    // A `None` payload removes the whole subtree.
    client
        .upload_node_value("magnets/shelf", None, TreeFlags::none(), None)
        .await
        .unwrap();

    wait_converged(&[&a, &b], 0, CONVERGE).await;
    let archive = b.client().save_archive(0).await.unwrap();
    assert!(!archive.children.contains_key("shelf"));

    a.shutdown().await;
    b.shutdown().await;
}

// =============================================================================
// Catch-up
// =============================================================================

#[tokio::test]
async fn catchup_late_joiner_restores_archive() {
    let mesh = InMemoryMesh::new();
    let senior = spawn_peer(&mesh, magnets_settings("late"));
    senior.wait_for(|h| h.role == PeerRole::Senior, CONVERGE).await.unwrap();

    let client = senior.client();
    for i in 0..10 {
        client
            .upload_node_value("magnets/", Some(magnet(&format!("m{i}"))), TreeFlags::INDEXED, None)
            .await
            .unwrap();
    }

    // Joins long after the writes happened.
    let late = spawn_peer(&mesh, magnets_settings("late"));
    late.wait_for(|h| h.ready() && h.senior.is_some(), CONVERGE).await.unwrap();

    wait_converged(&[&senior, &late], 0, CONVERGE).await;
    let archive = late.client().save_archive(0).await.unwrap();
    assert_eq!(archive.children.len(), 10);
    assert_eq!(archive.index.as_ref().map(Vec::len), Some(10));

    senior.shutdown().await;
    late.shutdown().await;
}

#[tokio::test]
async fn catchup_divergent_junior_recovers_via_resync() {
    let mesh = InMemoryMesh::new();
    let senior = spawn_peer(&mesh, magnets_settings("diverge"));
    senior.wait_for(|h| h.role == PeerRole::Senior, CONVERGE).await.unwrap();
    let junior = spawn_peer(&mesh, magnets_settings("diverge"));
    junior.wait_for(|h| h.ready() && h.senior.is_some(), CONVERGE).await.unwrap();

    senior
        .client()
        .upload_node_value("magnets/real", Some(magnet("real")), TreeFlags::none(), None)
        .await
        .unwrap();
    wait_converged(&[&senior, &junior], 0, CONVERGE).await;

    // Forge a checksum report that contradicts the junior's state: it
    // must declare divergence and resync from the senior.
    let sequence = junior.health().db_sequences[0];
    let forged = ReplicationEnvelope::checksum_report(0, sequence, 0xbad0_cafe).unwrap();
    let saboteur = mesh.endpoint();
    saboteur.send(WirePacket::Replication(forged)).await.unwrap();

    // Another write afterwards still converges everywhere.
    senior
        .client()
        .upload_node_value("magnets/after", Some(magnet("after")), TreeFlags::none(), None)
        .await
        .unwrap();

    wait_converged(&[&senior, &junior], 0, CONVERGE).await;
    let archive = junior.client().save_archive(0).await.unwrap();
    assert!(archive.children.contains_key("real"));
    assert!(archive.children.contains_key("after"));

    senior.shutdown().await;
    junior.shutdown().await;
}

// =============================================================================
// Election
// =============================================================================

#[tokio::test]
async fn election_failover_preserves_data() {
    let mesh = InMemoryMesh::new();
    let first = spawn_peer(&mesh, magnets_settings("failover"));
    first.wait_for(|h| h.role == PeerRole::Senior, CONVERGE).await.unwrap();
    let second = spawn_peer(&mesh, magnets_settings("failover"));
    second.wait_for(|h| h.ready() && h.senior.is_some(), CONVERGE).await.unwrap();

    // Write through whichever is senior now.
    let write_client = if first.health().role == PeerRole::Senior {
        first.client()
    } else {
        second.client()
    };
    write_client
        .upload_node_value("magnets/keep", Some(magnet("keep")), TreeFlags::none(), None)
        .await
        .unwrap();
    wait_converged(&[&first, &second], 0, CONVERGE).await;

    // Kill the senior; the survivor must take over with the data intact.
    let (survivor, casualty) = if first.health().role == PeerRole::Senior {
        (second, first)
    } else {
        (first, second)
    };
    casualty.shutdown().await;

    survivor
        .wait_for(|h| h.role == PeerRole::Senior, CONVERGE)
        .await
        .unwrap();

    let client = survivor.client();
    let archive = client.save_archive(0).await.unwrap();
    assert!(archive.children.contains_key("keep"));

    // And it accepts new writes as senior.
    client
        .upload_node_value("magnets/new", Some(magnet("new")), TreeFlags::none(), None)
        .await
        .unwrap();
    let (running, recomputed) = client.checksums(0).await.unwrap();
    assert_eq!(running, recomputed);

    survivor.shutdown().await;
}

#[tokio::test]
async fn election_move_index_entry_replicates() {
    let mesh = InMemoryMesh::new();
    let a = spawn_peer(&mesh, magnets_settings("move"));
    a.wait_for(|h| h.role == PeerRole::Senior, CONVERGE).await.unwrap();
    let b = spawn_peer(&mesh, magnets_settings("move"));
    b.wait_for(|h| h.ready() && h.senior.is_some(), CONVERGE).await.unwrap();

    let client = a.client();
    for colour in ["red", "green", "blue"] {
        client
            .upload_node_value("magnets/", Some(magnet(colour)), TreeFlags::INDEXED, None)
            .await
            .unwrap();
    }
    wait_converged(&[&a, &b], 0, CONVERGE).await;

    client
        .request_move_index_entry(
            "magnets",
            Some("I0".to_string()),
            Some(NodeFilter::named("I2")),
            TreeFlags::none(),
        )
        .await
        .unwrap();

    wait_converged(&[&a, &b], 0, CONVERGE).await;
    let archive = b.client().save_archive(0).await.unwrap();
    assert_eq!(
        archive.index.as_deref(),
        Some(&["I2".to_string(), "I0".into(), "I1".into()][..])
    );

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn election_three_peers_converge() {
    let mesh = InMemoryMesh::new();
    let peers: Vec<_> = (0..3)
        .map(|_| spawn_peer(&mesh, magnets_settings("trio")))
        .collect();
    for peer in &peers {
        peer.wait_for(|h| h.ready() && h.senior.is_some(), CONVERGE).await.unwrap();
    }

    // All peers must agree on one senior eventually.
    let senior_of = |p: &treemesh::MeshPeerHandle| p.health().senior;
    let deadline = std::time::Instant::now() + CONVERGE;
    loop {
        let opinions: Vec<_> = peers.iter().map(senior_of).collect();
        if opinions.iter().all(|o| o.is_some() && *o == opinions[0]) {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "no senior agreement");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // Any peer accepts a write (forwarded if junior).
    peers[2]
        .client()
        .upload_node_value("magnets/from-third", Some(magnet("x")), TreeFlags::none(), None)
        .await
        .unwrap();

    let refs: Vec<&treemesh::MeshPeerHandle> = peers.iter().collect();
    wait_converged(&refs, 0, CONVERGE).await;

    for peer in peers {
        peer.shutdown().await;
    }
}

#[tokio::test]
async fn replication_incompatible_database_count_rejected() {
    let mesh = InMemoryMesh::new();
    let one = spawn_peer(&mesh, magnets_settings("mismatch"));
    one.wait_for(|h| h.role == PeerRole::Senior, CONVERGE).await.unwrap();

    let mut other_settings = fast_settings("mismatch");
    other_settings.num_databases = 3;
    let other = spawn_peer(&mesh, other_settings);
    other
        .wait_for(|h| h.role != PeerRole::Startup, CONVERGE)
        .await
        .unwrap();

    // Give the advertisements (one per second) time to cross.
    tokio::time::sleep(Duration::from_millis(1500)).await;

    // Neither peer accepts the other into its membership.
    assert_eq!(one.health().attached_peers, 1);
    assert_eq!(other.health().attached_peers, 1);

    one.shutdown().await;
    other.shutdown().await;
}
