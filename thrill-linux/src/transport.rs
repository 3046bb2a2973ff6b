//! Local transport: TCP listener (invitations from peers), TCP dialer (peers we invite),
//! handshake + encrypted frames, and the [`LinkTransport`] the engine drives.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thrill_core::link::{decrypt_frame, derive_link_key, encrypt_frame, LinkKeypair};
use thrill_core::protocol::PROTOCOL_VERSION;
use thrill_core::wire::{encode_frame, frame_len};
use thrill_core::{PeerId, Transport, TransportError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};

use crate::actor::Input;
use crate::discovery::DiscoveryControl;

/// Dialer's frames count up from 0, the acceptor's from here, so nonces never collide
/// under the shared link key.
const ACCEPTOR_NONCE_BASE: u64 = 1 << 63;

/// A peer that has not finished its hello by then is dropped.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

struct Link {
    id: u64,
    sender: mpsc::UnboundedSender<Vec<u8>>,
}

/// Transport seen by the engine. Owned by the engine, so only the actor touches it.
pub struct LinkTransport {
    local_name: String,
    control: watch::Sender<DiscoveryControl>,
    dial_tx: mpsc::UnboundedSender<(PeerId, SocketAddr)>,
    addrs: HashMap<PeerId, SocketAddr>,
    links: HashMap<PeerId, Link>,
}

impl LinkTransport {
    pub fn new(
        local_name: String,
        control: watch::Sender<DiscoveryControl>,
        dial_tx: mpsc::UnboundedSender<(PeerId, SocketAddr)>,
    ) -> Self {
        Self {
            local_name,
            control,
            dial_tx,
            addrs: HashMap::new(),
            links: HashMap::new(),
        }
    }

    /// Last address discovery saw the peer at.
    pub fn remember(&mut self, peer: PeerId, addr: SocketAddr) {
        self.addrs.insert(peer, addr);
    }

    pub fn forget(&mut self, peer: &PeerId) {
        self.addrs.remove(peer);
    }

    pub fn knows(&self, peer: &PeerId) -> bool {
        self.addrs.contains_key(peer)
    }

    /// Register a live link's writer. Replaces any older link to the same peer.
    pub fn attach(&mut self, peer: PeerId, link_id: u64, sender: mpsc::UnboundedSender<Vec<u8>>) {
        if self.links.insert(peer.clone(), Link { id: link_id, sender }).is_some() {
            tracing::debug!("Replaced older link to {}", peer);
        }
    }

    /// Drop a closed link. Returns false when a newer link has already taken its place.
    pub fn detach(&mut self, peer: &PeerId, link_id: u64) -> bool {
        match self.links.get(peer) {
            Some(link) if link.id == link_id => {
                self.links.remove(peer);
                true
            }
            _ => false,
        }
    }

    /// Exactly one side dials: the one whose name sorts lower.
    fn should_dial(&self, peer: &PeerId) -> bool {
        self.local_name.as_str() < peer.as_str()
    }
}

impl Transport for LinkTransport {
    fn advertise(&mut self, service_id: &str) -> Result<(), TransportError> {
        self.control.send_modify(|c| {
            c.service_id = service_id.to_owned();
            c.advertising = true;
        });
        Ok(())
    }

    fn browse(&mut self, service_id: &str) -> Result<(), TransportError> {
        self.control.send_modify(|c| {
            c.service_id = service_id.to_owned();
            if !c.browsing {
                c.browsing = true;
                c.epoch += 1;
            }
        });
        Ok(())
    }

    fn stop_advertising(&mut self) {
        self.control.send_modify(|c| c.advertising = false);
    }

    fn stop_browsing(&mut self) {
        self.control.send_modify(|c| c.browsing = false);
    }

    fn connect(&mut self, peer: &PeerId) -> Result<(), TransportError> {
        if self.links.contains_key(peer) {
            return Ok(());
        }
        if !self.should_dial(peer) {
            tracing::debug!("Waiting for {} to dial us", peer);
            return Ok(());
        }
        let addr = *self
            .addrs
            .get(peer)
            .ok_or_else(|| TransportError::UnknownPeer(peer.clone()))?;
        self.dial_tx
            .send((peer.clone(), addr))
            .map_err(|_| TransportError::Unavailable("dialer stopped".into()))
    }

    fn send(&mut self, peer: &PeerId, bytes: Vec<u8>) -> Result<(), TransportError> {
        let link = self
            .links
            .get(peer)
            .ok_or_else(|| TransportError::NotConnected(peer.clone()))?;
        link.sender
            .send(bytes)
            .map_err(|_| TransportError::NotConnected(peer.clone()))
    }
}

/// Run transport: accept incoming links (offered to the engine as invitations) and dial
/// peers pushed to `dial_rx`.
pub async fn run_links(
    local_name: String,
    transport_port: u16,
    mut dial_rx: mpsc::UnboundedReceiver<(PeerId, SocketAddr)>,
    inputs: mpsc::UnboundedSender<Input>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", transport_port)).await?;
    tracing::info!("Accepting links on port {}", transport_port);
    let name: Arc<str> = Arc::from(local_name);

    let accept_name = name.clone();
    let accept_inputs = inputs.clone();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, from)) => {
                    tokio::spawn(accept_link(
                        stream,
                        from,
                        accept_name.clone(),
                        accept_inputs.clone(),
                    ));
                }
                Err(e) => {
                    tracing::warn!("Listener failed: {}", e);
                    break;
                }
            }
        }
    });

    while let Some((peer, addr)) = dial_rx.recv().await {
        tokio::spawn(dial_link(peer, addr, name.clone(), inputs.clone()));
    }
    Ok(())
}

async fn accept_link(
    mut stream: TcpStream,
    from: SocketAddr,
    name: Arc<str>,
    inputs: mpsc::UnboundedSender<Input>,
) {
    let (peer, key) = match handshake_within(&mut stream, &name, HANDSHAKE_TIMEOUT).await {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!("Handshake from {} failed: {}", from, e);
            return;
        }
    };
    let (reply_tx, reply_rx) = oneshot::channel();
    let invitation = Input::Invitation {
        peer: peer.clone(),
        reply: reply_tx,
    };
    if inputs.send(invitation).is_err() {
        return;
    }
    if !matches!(reply_rx.await, Ok(true)) {
        tracing::info!("Declined link from {}", peer);
        return;
    }
    run_link(stream, peer, key, ACCEPTOR_NONCE_BASE, inputs).await;
}

async fn dial_link(peer: PeerId, addr: SocketAddr, name: Arc<str>, inputs: mpsc::UnboundedSender<Input>) {
    let dialed = async {
        let mut stream = TcpStream::connect(addr).await?;
        let (remote, key) = handshake_within(&mut stream, &name, HANDSHAKE_TIMEOUT).await?;
        if remote != peer {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("{} answered as {}", addr, remote),
            ));
        }
        Ok::<_, std::io::Error>((stream, key))
    };
    let result = dialed.await;
    match result {
        Ok((stream, key)) => run_link(stream, peer, key, 0, inputs).await,
        Err(e) => {
            let _ = inputs.send(Input::DialFailed {
                peer,
                reason: e.to_string(),
            });
        }
    }
}

/// Both sides send: version (1) + X25519 public key (32) + name length (2, LE) + name.
fn hello_bytes(keypair: &LinkKeypair, name: &str) -> std::io::Result<Vec<u8>> {
    let name_len = u16::try_from(name.len())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "name too long"))?;
    let mut out = Vec::with_capacity(1 + 32 + 2 + name.len());
    out.push(PROTOCOL_VERSION);
    out.extend_from_slice(keypair.public_key());
    out.extend_from_slice(&name_len.to_le_bytes());
    out.extend_from_slice(name.as_bytes());
    Ok(out)
}

async fn read_hello<R: AsyncRead + Unpin>(r: &mut R) -> std::io::Result<([u8; 32], PeerId)> {
    let version = r.read_u8().await?;
    if version != PROTOCOL_VERSION {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "unsupported protocol version",
        ));
    }
    let mut public_key = [0u8; 32];
    r.read_exact(&mut public_key).await?;
    let name_len = r.read_u16_le().await?;
    let mut name = vec![0u8; usize::from(name_len)];
    r.read_exact(&mut name).await?;
    let name = String::from_utf8(name)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    if name.is_empty() {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "empty name"));
    }
    Ok((public_key, PeerId::new(name)))
}

/// Symmetric handshake with a fresh keypair per link. Returns the remote name and link key.
async fn handshake_within<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    name: &str,
    limit: Duration,
) -> std::io::Result<(PeerId, [u8; 32])> {
    match tokio::time::timeout(limit, handshake(stream, name)).await {
        Ok(res) => res,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "no hello before the deadline",
        )),
    }
}

async fn handshake<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    name: &str,
) -> std::io::Result<(PeerId, [u8; 32])> {
    let keypair = LinkKeypair::generate();
    stream.write_all(&hello_bytes(&keypair, name)?).await?;
    stream.flush().await?;
    let (remote_public, peer) = read_hello(stream).await?;
    let key = derive_link_key(&keypair.shared_secret(&remote_public));
    Ok((peer, key))
}

fn invalid_data<E: std::fmt::Display>(e: E) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
}

async fn write_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    key: &[u8; 32],
    nonce: u64,
    plain: &[u8],
) -> std::io::Result<()> {
    let cipher = encrypt_frame(key, nonce, plain).map_err(invalid_data)?;
    let frame = encode_frame(&cipher).map_err(invalid_data)?;
    w.write_all(&frame).await?;
    w.flush().await
}

async fn read_frame<R: AsyncRead + Unpin>(r: &mut R, key: &[u8; 32], nonce: u64) -> std::io::Result<Vec<u8>> {
    let mut header = [0u8; 4];
    r.read_exact(&mut header).await?;
    let len = frame_len(header).map_err(invalid_data)?;
    let mut cipher = vec![0u8; len];
    r.read_exact(&mut cipher).await?;
    decrypt_frame(key, nonce, &cipher).map_err(invalid_data)
}

/// Pump an established link until either side closes it.
async fn run_link(
    stream: TcpStream,
    peer: PeerId,
    key: [u8; 32],
    send_base: u64,
    inputs: mpsc::UnboundedSender<Input>,
) {
    let link_id = NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed);
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let up = Input::LinkUp {
        peer: peer.clone(),
        link_id,
        sender: tx,
    };
    if inputs.send(up).is_err() {
        return;
    }
    tracing::info!("Link {} to {} up", link_id, peer);

    let (mut reader, mut writer) = stream.into_split();
    let writer_peer = peer.clone();
    let writer_task = tokio::spawn(async move {
        let mut nonce = send_base;
        while let Some(plain) = rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &key, nonce, &plain).await {
                tracing::debug!("Write to {} failed: {}", writer_peer, e);
                break;
            }
            nonce = nonce.wrapping_add(1);
        }
    });

    let mut nonce = send_base ^ ACCEPTOR_NONCE_BASE;
    loop {
        match read_frame(&mut reader, &key, nonce).await {
            Ok(bytes) => {
                nonce = nonce.wrapping_add(1);
                let input = Input::Bytes {
                    peer: peer.clone(),
                    bytes,
                };
                if inputs.send(input).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!("Link {} to {} closed: {}", link_id, peer, e);
                break;
            }
        }
    }
    writer_task.abort();
    let _ = inputs.send(Input::LinkDown { peer, link_id });
}
