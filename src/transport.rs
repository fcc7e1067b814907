// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Datagram transport.
//!
//! The replication core treats the network as an unreliable datagram
//! transport: packets may be dropped or reordered, and the protocol
//! layers above (sequence numbers, beacons, catch-up) recover. This
//! module provides the [`Transport`] trait, the UDP-multicast
//! implementation used by real peers, and [`InMemoryMesh`] for tests and
//! single-process setups.
//!
//! # Group derivation
//!
//! Each system gets its own multicast group derived from the system name
//! hash inside the organization-local 239.192.0.0/14 block, so unrelated
//! systems on the same LAN never see each other's traffic.
//! Advertisements go to a fixed discovery group that operator tools can
//! listen on without knowing any system name.

use crate::error::{Error, Result};
use crate::wire::{decode_packet, encode_packet, WirePacket};
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::pin::Pin;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Type alias for boxed async futures (reduces trait signature
/// complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Fixed discovery group for system advertisements.
pub const DISCOVERY_GROUP: Ipv4Addr = Ipv4Addr::new(239, 192, 0, 1);
/// Port for the discovery group.
pub const DISCOVERY_PORT: u16 = 41213;
/// Port shared by all system traffic groups.
pub const SYSTEM_PORT: u16 = 41214;

/// Bounded queue between the socket reader task and the session loop.
const RECV_QUEUE_DEPTH: usize = 1024;

/// A best-effort broadcast channel to every peer of one system.
pub trait Transport: Send + Sync + 'static {
    /// Broadcast a packet to the system group (advertisements go to the
    /// discovery group instead).
    fn send(&self, packet: WirePacket) -> BoxFuture<'_, ()>;

    /// Receive the next packet. Returns `None` when the transport has
    /// shut down.
    fn recv(&self) -> BoxFuture<'_, Option<WirePacket>>;
}

/// Derive a system's multicast group from its name.
pub fn system_group(system_name: &str) -> SocketAddrV4 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    system_name.hash(&mut hasher);
    let h = hasher.finish();
    // 239.192.0.0/14, skipping .0.x which holds the discovery group.
    let b2 = 192 + ((h >> 8) & 0x03) as u8;
    let b3 = (h >> 16) as u8;
    let b4 = ((h & 0xff) as u8).max(2);
    SocketAddrV4::new(Ipv4Addr::new(239, b2, b3, b4), SYSTEM_PORT)
}

/// UDP multicast transport for one system.
///
/// Two sockets: the system group for heartbeats/beacons/replication, and
/// the discovery group for advertisements. A reader task per socket
/// decodes datagrams into a bounded queue; when the session loop falls
/// behind, the oldest unread packets are dropped — exactly the loss
/// semantics the protocol is built to survive.
pub struct UdpMulticastTransport {
    system_socket: Arc<UdpSocket>,
    discovery_socket: Arc<UdpSocket>,
    group: SocketAddrV4,
    recv_rx: Mutex<mpsc::Receiver<WirePacket>>,
}

impl UdpMulticastTransport {
    /// Bind and join the groups for `system_name`. With `localhost_only`
    /// the group is joined on the loopback interface only.
    pub async fn bind(system_name: &str, localhost_only: bool) -> Result<Self> {
        let group = system_group(system_name);
        let interface = if localhost_only {
            Ipv4Addr::LOCALHOST
        } else {
            Ipv4Addr::UNSPECIFIED
        };

        let system_socket = Arc::new(Self::multicast_socket(*group.ip(), group.port(), interface)?);
        let discovery_socket =
            Arc::new(Self::multicast_socket(DISCOVERY_GROUP, DISCOVERY_PORT, interface)?);

        info!(
            system = system_name,
            group = %group,
            localhost_only,
            "joined multicast groups"
        );

        let (recv_tx, recv_rx) = mpsc::channel(RECV_QUEUE_DEPTH);
        Self::spawn_reader(Arc::clone(&system_socket), recv_tx.clone());
        Self::spawn_reader(Arc::clone(&discovery_socket), recv_tx);

        Ok(Self {
            system_socket,
            discovery_socket,
            group,
            recv_rx: Mutex::new(recv_rx),
        })
    }

    /// A UDP socket bound to `port` with address reuse, joined to
    /// `group` on `interface`, with multicast loopback enabled so
    /// multiple peers on one host hear each other.
    fn multicast_socket(group: Ipv4Addr, port: u16, interface: Ipv4Addr) -> Result<UdpSocket> {
        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
        socket.join_multicast_v4(&group, &interface)?;
        socket.set_multicast_loop_v4(true)?;
        UdpSocket::from_std(socket.into()).map_err(Error::from)
    }

    fn spawn_reader(socket: Arc<UdpSocket>, tx: mpsc::Sender<WirePacket>) {
        tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let (len, from) = match socket.recv_from(&mut buf).await {
                    Ok(ok) => ok,
                    Err(e) => {
                        warn!(error = %e, "multicast receive failed, reader stopping");
                        break;
                    }
                };
                match decode_packet(&buf[..len]) {
                    Ok(packet) => {
                        if tx.try_send(packet).is_err() {
                            // Queue full or session gone: drop, like the
                            // network would.
                            debug!(%from, "receive queue full, packet dropped");
                        }
                    }
                    Err(e) => debug!(%from, error = %e, "undecodable datagram ignored"),
                }
            }
        });
    }
}

impl Transport for UdpMulticastTransport {
    fn send(&self, packet: WirePacket) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let bytes = encode_packet(&packet)?;
            match &packet {
                WirePacket::Advertisement(_) => {
                    self.discovery_socket
                        .send_to(&bytes, SocketAddrV4::new(DISCOVERY_GROUP, DISCOVERY_PORT))
                        .await?;
                }
                _ => {
                    self.system_socket.send_to(&bytes, self.group).await?;
                }
            }
            Ok(())
        })
    }

    fn recv(&self) -> BoxFuture<'_, Option<WirePacket>> {
        Box::pin(async move { Ok(self.recv_rx.lock().await.recv().await) })
    }
}

// ═══════════════════════════════════════════════════════════════════════
// In-memory mesh (tests / single-process systems)
// ═══════════════════════════════════════════════════════════════════════

/// A process-local multicast mesh. Every endpoint's `send` delivers to
/// every *other* endpoint, in order, losslessly — handy for protocol
/// tests that want determinism, and for single-process demo setups.
#[derive(Clone, Default)]
pub struct InMemoryMesh {
    endpoints: Arc<std::sync::Mutex<Vec<(usize, mpsc::UnboundedSender<WirePacket>)>>>,
    next_id: Arc<std::sync::atomic::AtomicUsize>,
}

impl InMemoryMesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new endpoint on the mesh.
    pub fn endpoint(&self) -> MeshEndpoint {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.endpoints.lock().expect("mesh lock").push((id, tx));
        MeshEndpoint {
            id,
            mesh: self.clone(),
            rx: Mutex::new(rx),
        }
    }

    fn broadcast_from(&self, sender: usize, packet: &WirePacket) {
        let mut endpoints = self.endpoints.lock().expect("mesh lock");
        endpoints.retain(|(id, tx)| *id == sender || tx.send(packet.clone()).is_ok());
    }
}

/// One endpoint of an [`InMemoryMesh`].
pub struct MeshEndpoint {
    id: usize,
    mesh: InMemoryMesh,
    rx: Mutex<mpsc::UnboundedReceiver<WirePacket>>,
}

impl Transport for MeshEndpoint {
    fn send(&self, packet: WirePacket) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.mesh.broadcast_from(self.id, &packet);
            Ok(())
        })
    }

    fn recv(&self) -> BoxFuture<'_, Option<WirePacket>> {
        Box::pin(async move { Ok(self.rx.lock().await.recv().await) })
    }
}
