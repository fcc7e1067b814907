//! Operator CLI for treemesh systems.
//!
//! Exit codes: 0 ok, 2 bad argument, 3 timeout, 4 divergence.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tracing::debug;
use treemesh::transport::{Transport, UdpMulticastTransport};
use treemesh::wire::WirePacket;
use treemesh::{Error, MeshPeer, MeshPeerHandle, PeerSettings, PeerType, SystemCatalog};

#[derive(Parser, Debug)]
#[command(name = "treemeshctl")]
#[command(about = "Inspect and join treemesh systems on the local network")]
struct Args {
    /// Restrict multicast to loopback interfaces.
    #[arg(long)]
    localhost_only: bool,

    /// How long to wait for the network before giving up.
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    timeout: Duration,

    #[command(subcommand)]
    command: CtlCommand,
}

#[derive(Subcommand, Debug)]
enum CtlCommand {
    /// Listen for advertisements and list the systems heard.
    ListSystems,
    /// Join a system as a junior-only peer and report its status.
    Connect { system_name: String },
    /// Join a system and dump one database as JSON.
    Dump {
        system_name: String,
        db_index: u8,
    },
    /// Join a system and verify one database's checksum.
    Checksum {
        system_name: String,
        db_index: u8,
    },
}

fn exit_code_for(err: &Error) -> ExitCode {
    match err {
        Error::BadArgument(_) | Error::Config(_) => ExitCode::from(2),
        Error::TimedOut => ExitCode::from(3),
        Error::Diverged { .. } => ExitCode::from(4),
        _ => ExitCode::from(1),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    let result = match &args.command {
        CtlCommand::ListSystems => list_systems(&args).await,
        CtlCommand::Connect { system_name } => connect(&args, system_name).await,
        CtlCommand::Dump { system_name, db_index } => dump(&args, system_name, *db_index).await,
        CtlCommand::Checksum { system_name, db_index } => {
            checksum(&args, system_name, *db_index).await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            exit_code_for(&err)
        }
    }
}

async fn list_systems(args: &Args) -> Result<(), Error> {
    // Any group membership includes the discovery group; the system name
    // here only selects which (unused) traffic group we join.
    let transport = UdpMulticastTransport::bind("treemeshctl", args.localhost_only).await?;
    let mut catalog = SystemCatalog::standard();

    let deadline = Instant::now() + args.timeout;
    while Instant::now() < deadline {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, transport.recv()).await {
            Ok(Ok(Some(WirePacket::Advertisement(advert)))) => {
                catalog.observe(advert, Instant::now());
            }
            Ok(Ok(Some(_))) => {}
            Ok(Ok(None)) | Ok(Err(_)) => break,
            Err(_) => break, // listening window over
        }
    }

    let systems = catalog.systems();
    if systems.is_empty() {
        println!("no systems heard in {}", humantime::format_duration(args.timeout));
        return Ok(());
    }
    println!("{:<24} {:>4} {:>6} {:>7}  last seen", "system", "dbs", "full", "junior");
    for s in systems {
        println!(
            "{:<24} {:>4} {:>6} {:>7}  {}",
            s.system_name,
            s.num_databases,
            s.full_peers,
            s.junior_peers,
            s.last_seen.format("%H:%M:%S%.3f")
        );
    }
    Ok(())
}

/// Discover a system's database count, then join it as a junior-only
/// peer and wait until it is attached and caught up.
async fn join(args: &Args, system_name: &str) -> Result<MeshPeerHandle, Error> {
    let transport = UdpMulticastTransport::bind(system_name, args.localhost_only).await?;

    // The peer settings must agree with the system's database count.
    let deadline = Instant::now() + args.timeout;
    let num_databases = loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::TimedOut);
        }
        match tokio::time::timeout(remaining, transport.recv()).await {
            Ok(Ok(Some(WirePacket::Advertisement(advert)))) if advert.system_name == system_name => {
                break advert.num_databases;
            }
            Ok(Ok(Some(_))) => continue,
            Ok(Ok(None)) | Ok(Err(_)) => return Err(Error::Shutdown),
            Err(_) => return Err(Error::TimedOut),
        }
    };
    debug!(system = system_name, num_databases, "system discovered");

    let settings = PeerSettings {
        system_name: system_name.to_string(),
        num_databases,
        localhost_only: args.localhost_only,
        peer_type: PeerType::JuniorOnly,
        // Observer peers attach quickly; the system is already running.
        heartbeats_before_fully_attached: 1,
        ..Default::default()
    };
    let peer = MeshPeer::spawn(settings, Arc::new(transport))?;
    peer.wait_for(|h| h.ready() && h.senior.is_some() && h.synced, args.timeout)
        .await?;
    Ok(peer)
}

async fn connect(args: &Args, system_name: &str) -> Result<(), Error> {
    let peer = join(args, system_name).await?;
    let health = peer.health();
    println!("connected to {system_name} as {}", peer.local_id());
    println!("  role:     {}", health.role);
    println!("  senior:   {}", health.senior.map(|p| p.to_string()).unwrap_or_default());
    println!("  peers:    {}", health.attached_peers);
    for (i, (cs, seq)) in health.db_checksums.iter().zip(&health.db_sequences).enumerate() {
        println!("  db {i}: sequence {seq}, checksum {cs:#010x}");
    }
    println!("watching; ctrl-c to leave");
    let _ = tokio::signal::ctrl_c().await;
    peer.shutdown().await;
    Ok(())
}

async fn dump(args: &Args, system_name: &str, db_index: u8) -> Result<(), Error> {
    let peer = join(args, system_name).await?;
    let outcome = async {
        let archive = peer.client().save_archive(db_index).await?;
        let json = serde_json::to_string_pretty(&archive)
            .map_err(|e| Error::codec(format!("archive to JSON: {e}")))?;
        println!("{json}");
        Ok(())
    }
    .await;
    peer.shutdown().await;
    outcome
}

async fn checksum(args: &Args, system_name: &str, db_index: u8) -> Result<(), Error> {
    let peer = join(args, system_name).await?;
    let outcome = async {
        let (running, recomputed) = peer.client().checksums(db_index).await?;
        println!("db {db_index}: running {running:#010x}, recomputed {recomputed:#010x}");
        if running != recomputed {
            let sequence = peer.health().db_sequences.get(db_index as usize).copied().unwrap_or(0);
            return Err(Error::Diverged {
                db_index,
                sequence,
                local: recomputed,
                reported: running,
            });
        }
        Ok(())
    }
    .await;
    peer.shutdown().await;
    outcome
}
