//! LAN discovery: UDP multicast beacons while advertising, peer found/lost while browsing.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thrill_core::protocol::PROTOCOL_VERSION;
use thrill_core::wire::{decode_beacon, encode_beacon, Beacon};
use thrill_core::PeerId;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex};

use crate::actor::Input;

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 61);
const BEACON_INTERVAL: Duration = Duration::from_secs(4);
const PEER_TIMEOUT: Duration = Duration::from_secs(16);

/// What the engine currently wants from discovery. Written by the transport, read here.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryControl {
    pub service_id: String,
    pub advertising: bool,
    pub browsing: bool,
    /// Bumped each time browsing starts, so peers seen earlier are reported again.
    pub epoch: u64,
}

struct PeerState {
    last_seen: Instant,
    epoch: u64,
}

type Peers = Arc<Mutex<HashMap<PeerId, PeerState>>>;

pub async fn run_discovery(
    local_name: String,
    discovery_port: u16,
    transport_port: u16,
    control: watch::Receiver<DiscoveryControl>,
    inputs: mpsc::UnboundedSender<Input>,
) -> std::io::Result<()> {
    let socket = Arc::new(make_multicast_socket(discovery_port)?);
    let peers: Peers = Arc::new(Mutex::new(HashMap::new()));
    let name: Arc<str> = Arc::from(local_name);
    tracing::info!("Discovery on {}:{}", MULTICAST_GROUP, discovery_port);

    let beacon_task = tokio::spawn(beacon_loop(
        socket.clone(),
        control.clone(),
        name.clone(),
        discovery_port,
        transport_port,
    ));
    let recv_task = tokio::spawn(recv_loop(
        socket,
        control,
        peers.clone(),
        name,
        transport_port,
        inputs.clone(),
    ));
    let timeout_task = tokio::spawn(peer_timeout_loop(peers, inputs));

    let (beacon, recv, timeout) = tokio::try_join!(beacon_task, recv_task, timeout_task)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    beacon?;
    recv?;
    timeout?;
    Ok(())
}

fn make_multicast_socket(discovery_port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, discovery_port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

/// Our beacon for the current service, if advertising.
fn current_beacon(control: &DiscoveryControl, name: &str, transport_port: u16) -> Option<Vec<u8>> {
    if !control.advertising {
        return None;
    }
    match encode_beacon(&Beacon::new(&control.service_id, name, transport_port)) {
        Ok(frame) => Some(frame),
        Err(e) => {
            tracing::warn!("Cannot encode beacon: {}", e);
            None
        }
    }
}

async fn beacon_loop(
    socket: Arc<UdpSocket>,
    mut control: watch::Receiver<DiscoveryControl>,
    name: Arc<str>,
    discovery_port: u16,
    transport_port: u16,
) -> std::io::Result<()> {
    let dest = SocketAddr::V4(SocketAddrV4::new(MULTICAST_GROUP, discovery_port));
    loop {
        let frame = current_beacon(&control.borrow_and_update(), &name, transport_port);
        if let Some(frame) = frame {
            if let Err(e) = socket.send_to(&frame, dest).await {
                tracing::debug!("Beacon send failed: {}", e);
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(BEACON_INTERVAL) => {}
            changed = control.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

/// Whether a received beacon belongs to a peer we should report.
fn is_relevant(beacon: &Beacon, own_name: &str, service_id: &str) -> bool {
    beacon.protocol_version == PROTOCOL_VERSION
        && beacon.service_id == service_id
        && beacon.name != own_name
        && !beacon.name.is_empty()
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    control: watch::Receiver<DiscoveryControl>,
    peers: Peers,
    name: Arc<str>,
    transport_port: u16,
    inputs: mpsc::UnboundedSender<Input>,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; 65536];
    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        let beacon = match decode_beacon(&buf[..n]) {
            Ok(b) => b,
            Err(e) => {
                tracing::trace!("Ignoring datagram from {}: {}", from, e);
                continue;
            }
        };
        let (relevant, browsing, epoch, reply) = {
            let c = control.borrow();
            (
                is_relevant(&beacon, &name, &c.service_id),
                c.browsing,
                c.epoch,
                current_beacon(&c, &name, transport_port),
            )
        };
        if !relevant || !browsing {
            continue;
        }
        let peer = PeerId::new(beacon.name);
        let is_new = {
            let mut p = peers.lock().await;
            let previous = p.insert(
                peer.clone(),
                PeerState {
                    last_seen: Instant::now(),
                    epoch,
                },
            );
            previous.map(|s| s.epoch != epoch).unwrap_or(true)
        };
        if !is_new {
            continue;
        }
        tracing::debug!("Found {} at {}", peer, from.ip());
        let addr = SocketAddr::new(from.ip(), beacon.transport_port);
        if inputs.send(Input::PeerFound { peer, addr }).is_err() {
            return Ok(());
        }
        // Answer directly so the newcomer does not wait a full interval to see us.
        if let Some(reply) = reply {
            let _ = socket.send_to(&reply, from).await;
        }
    }
}

async fn peer_timeout_loop(peers: Peers, inputs: mpsc::UnboundedSender<Input>) -> std::io::Result<()> {
    loop {
        tokio::time::sleep(BEACON_INTERVAL).await;
        let now = Instant::now();
        let timed_out: Vec<PeerId> = {
            let mut p = peers.lock().await;
            let list: Vec<PeerId> = p
                .iter()
                .filter(|(_, s)| now.duration_since(s.last_seen) >= PEER_TIMEOUT)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &list {
                p.remove(id);
            }
            list
        };
        for peer in timed_out {
            tracing::debug!("{} timed out", peer);
            if inputs.send(Input::PeerLost(peer)).is_err() {
                return Ok(());
            }
        }
    }
}
