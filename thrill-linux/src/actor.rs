//! The actor task owns the engine. Discovery, links and the console talk to it through
//! [`Input`]; it answers with console output and a published [`Snapshot`].

use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::time::{Duration, SystemTime};

use thrill_core::{ConnectionState, PeerId, PeerRecord, ThrillEngine, ThrillRequest};
use tokio::sync::{mpsc, oneshot, watch};

use crate::console::{self, Command, Output};
use crate::ranging::ManualRanging;
use crate::transport::LinkTransport;

const TICK_INTERVAL: Duration = Duration::from_secs(1);

pub type Engine = ThrillEngine<LinkTransport, ManualRanging>;

pub enum Input {
    PeerFound {
        peer: PeerId,
        addr: SocketAddr,
    },
    PeerLost(PeerId),
    /// A remote peer dialed us; reply whether to keep the link.
    Invitation {
        peer: PeerId,
        reply: oneshot::Sender<bool>,
    },
    LinkUp {
        peer: PeerId,
        link_id: u64,
        sender: mpsc::UnboundedSender<Vec<u8>>,
    },
    LinkDown {
        peer: PeerId,
        link_id: u64,
    },
    DialFailed {
        peer: PeerId,
        reason: String,
    },
    Bytes {
        peer: PeerId,
        bytes: Vec<u8>,
    },
    Command(Command),
}

/// Read-only view of the engine for the console.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub scanning: bool,
    pub status: String,
    pub peers: Vec<PeerRecord>,
    pub pending: Vec<ThrillRequest>,
}

impl Snapshot {
    fn of(engine: &Engine) -> Self {
        Self {
            scanning: engine.is_scanning(),
            status: engine.status().to_owned(),
            peers: engine.registry().snapshot(),
            pending: engine.pending_requests().to_vec(),
        }
    }
}

/// Run until the console quits or every input sender is gone.
pub async fn run(
    mut engine: Engine,
    mut inputs: mpsc::UnboundedReceiver<Input>,
    snapshots: watch::Sender<Snapshot>,
    output: mpsc::UnboundedSender<Output>,
) {
    let mut tick = tokio::time::interval(TICK_INTERVAL);
    snapshots.send_replace(Snapshot::of(&engine));
    loop {
        let flow = tokio::select! {
            input = inputs.recv() => match input {
                Some(input) => handle(&mut engine, input, &output),
                None => ControlFlow::Break(()),
            },
            _ = tick.tick() => {
                engine.tick(SystemTime::now());
                ControlFlow::Continue(())
            }
        };
        flush(&mut engine, &snapshots, &output);
        if flow.is_break() {
            break;
        }
    }
    engine.stop_discovery();
    flush(&mut engine, &snapshots, &output);
    tracing::info!("Actor stopped");
}

fn flush(engine: &mut Engine, snapshots: &watch::Sender<Snapshot>, output: &mpsc::UnboundedSender<Output>) {
    let events = engine.take_events();
    if events.is_empty() {
        return;
    }
    for event in events {
        let _ = output.send(Output::Event(event));
    }
    snapshots.send_replace(Snapshot::of(engine));
}

fn handle(engine: &mut Engine, input: Input, output: &mpsc::UnboundedSender<Output>) -> ControlFlow<()> {
    match input {
        Input::PeerFound { peer, addr } => {
            engine.transport_mut().remember(peer.clone(), addr);
            engine.on_peer_found(peer);
        }
        Input::PeerLost(peer) => {
            engine.transport_mut().forget(&peer);
            engine.on_peer_lost(&peer);
        }
        Input::Invitation { peer, reply } => {
            let accept = engine.on_invitation(&peer);
            if accept {
                engine.on_connection_state_changed(peer, ConnectionState::Connecting);
            }
            let _ = reply.send(accept);
        }
        Input::LinkUp {
            peer,
            link_id,
            sender,
        } => {
            engine.transport_mut().attach(peer.clone(), link_id, sender);
            engine.on_connection_state_changed(peer, ConnectionState::Connected);
        }
        Input::LinkDown { peer, link_id } => {
            if engine.transport_mut().detach(&peer, link_id) {
                engine.on_connection_state_changed(peer.clone(), ConnectionState::Disconnected);
                // A peer that is still beaconing gets one more link attempt.
                if engine.is_scanning() && engine.transport().knows(&peer) {
                    engine.on_peer_found(peer);
                }
            }
        }
        Input::DialFailed { peer, reason } => {
            tracing::warn!("Dial to {} failed: {}", peer, reason);
            engine.on_connection_state_changed(peer, ConnectionState::Disconnected);
        }
        Input::Bytes { peer, bytes } => engine.on_bytes_received(peer, &bytes),
        Input::Command(cmd) => return execute(engine, cmd, output),
    }
    ControlFlow::Continue(())
}

/// Engine errors surface as status changes, so most results are only logged here.
fn execute(engine: &mut Engine, cmd: Command, output: &mpsc::UnboundedSender<Output>) -> ControlFlow<()> {
    let notice = |text: String| {
        let _ = output.send(Output::Notice(text));
    };
    match cmd {
        Command::Start => {
            if let Err(e) = engine.start_discovery() {
                tracing::debug!("start_discovery: {}", e);
            }
        }
        Command::Stop => engine.stop_discovery(),
        Command::Thrill(peer) => {
            if let Err(e) = engine.send_thrill_request(&peer) {
                tracing::debug!("send_thrill_request: {}", e);
            }
        }
        Command::Accept(selector) => respond(engine, &selector, true, notice),
        Command::Decline(selector) => respond(engine, &selector, false, notice),
        Command::Range { peer, reading } => {
            let Some(token) = engine.remote_token(&peer).cloned() else {
                notice(format!("No ranging token from {} yet", peer));
                return ControlFlow::Continue(());
            };
            match reading {
                Some(r) => match engine.ranging().sample(&token, r.distance_m, r.direction) {
                    Ok(sample) => engine.on_ranging_sample(sample),
                    Err(e) => notice(format!("Cannot range {}: {}", peer, e)),
                },
                None => engine.on_ranging_removed(&token),
            }
        }
        Command::Quit => return ControlFlow::Break(()),
        // Answered by the console from the snapshot.
        Command::Peers | Command::Pending | Command::Status | Command::Help => {}
    }
    ControlFlow::Continue(())
}

fn respond(engine: &mut Engine, selector: &str, accepted: bool, notice: impl Fn(String)) {
    match console::resolve_request(engine.pending_requests(), selector) {
        Ok(id) => {
            if let Err(e) = engine.respond_to_thrill_request(id, accepted) {
                tracing::debug!("respond_to_thrill_request: {}", e);
            }
        }
        Err(e) => notice(e.to_string()),
    }
}
