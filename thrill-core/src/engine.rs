//! Host-driven engine: the host passes transport, ranging and presentation input in;
//! the engine drives its collaborators and queues [`Event`]s for the host to drain.
//!
//! All registry mutation happens here, so whoever owns the engine is the single writer.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::SystemTime;

use crate::config::{DuplicatePolicy, EngineConfig};
use crate::identity::{DiscoveryToken, PeerId, RequestId};
use crate::protocol::{self, EncodeError, Message};
use crate::ranging::{Ranging, RangingError, RangingInterruption, RangingSample};
use crate::registry::{ConnectionState, PeerRecord, PeerRegistry, Upsert};
use crate::transport::{Transport, TransportError};

/// An incoming request waiting for a local accept/decline.
#[derive(Debug, Clone, PartialEq)]
pub struct ThrillRequest {
    pub id: RequestId,
    /// Transport identity of the sender; responses go here.
    pub from_peer_id: PeerId,
    /// Name the sender put in the message.
    pub from_name: String,
    pub created_at: SystemTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WithdrawReason {
    /// Same peer sent a newer request under `DuplicatePolicy::Replace`.
    Superseded,
    /// Pending longer than the configured TTL.
    Expired,
}

/// Everything the presentation layer needs to know about.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    PeerDiscovered(PeerRecord),
    PeerUpdated(PeerRecord),
    PeerLost(PeerId),
    RequestReceived(ThrillRequest),
    /// We answered an incoming request.
    RequestResolved {
        request_id: RequestId,
        peer_id: PeerId,
        accepted: bool,
    },
    /// An incoming request left the pending set without an answer.
    RequestWithdrawn {
        request_id: RequestId,
        peer_id: PeerId,
        reason: WithdrawReason,
    },
    /// A peer answered a request we sent.
    ResponseReceived {
        peer_id: PeerId,
        responder: String,
        accepted: bool,
    },
    StatusChanged(String),
}

pub struct ThrillEngine<T: Transport, R: Ranging> {
    config: EngineConfig,
    transport: T,
    ranging: R,
    registry: PeerRegistry,
    scanning: bool,
    local_token: Option<DiscoveryToken>,
    /// Peers with a live transport link, independent of the registry.
    linked: BTreeSet<PeerId>,
    token_peers: HashMap<DiscoveryToken, PeerId>,
    peer_tokens: HashMap<PeerId, DiscoveryToken>,
    /// Arrival order.
    pending: Vec<ThrillRequest>,
    awaiting_response: HashSet<PeerId>,
    status: String,
    events: Vec<Event>,
}

impl<T: Transport, R: Ranging> ThrillEngine<T, R> {
    pub fn new(config: EngineConfig, transport: T, ranging: R) -> Self {
        Self {
            config,
            transport,
            ranging,
            registry: PeerRegistry::new(),
            scanning: false,
            local_token: None,
            linked: BTreeSet::new(),
            token_peers: HashMap::new(),
            peer_tokens: HashMap::new(),
            pending: Vec::new(),
            awaiting_response: HashSet::new(),
            status: "Ready to scan".to_owned(),
            events: Vec::new(),
        }
    }

    // ---- presentation commands ----

    /// Start ranging, advertising and browsing. A no-op while already scanning with a live token.
    pub fn start_discovery(&mut self) -> Result<(), EngineError> {
        if self.scanning && self.local_token.is_some() {
            return Ok(());
        }
        if !self.ranging.is_supported() {
            return Err(self.fail(EngineError::UnsupportedPlatform));
        }
        let token = match self.ranging.start() {
            Ok(t) => t,
            Err(e) => return Err(self.fail(EngineError::Ranging(e))),
        };
        if !self.scanning {
            if let Err(e) = self.transport.advertise(&self.config.service_id) {
                self.ranging.stop();
                return Err(self.fail(EngineError::Discovery(e)));
            }
            if let Err(e) = self.transport.browse(&self.config.service_id) {
                self.transport.stop_advertising();
                self.ranging.stop();
                return Err(self.fail(EngineError::Discovery(e)));
            }
            self.scanning = true;
        }
        tracing::info!(
            "Discovery started for service '{}' (token {})",
            self.config.service_id,
            token.fingerprint()
        );
        self.local_token = Some(token);
        self.set_status("Scanning for nearby users...");
        self.reattach_linked_peers();
        Ok(())
    }

    /// Tear down ranging, advertising and browsing and forget every peer record.
    /// Idempotent. Pending incoming requests are left untouched.
    pub fn stop_discovery(&mut self) {
        self.ranging.stop();
        self.transport.stop_advertising();
        self.transport.stop_browsing();
        if self.scanning {
            tracing::info!("Discovery stopped");
        }
        self.scanning = false;
        self.local_token = None;
        self.awaiting_response.clear();
        for peer in self.registry.clear() {
            self.events.push(Event::PeerLost(peer));
        }
        self.set_status("Scanning stopped");
    }

    /// Send a thrill request. The peer must be connected; proximity is only re-checked
    /// when `enforce_proximity` is configured.
    pub fn send_thrill_request(&mut self, peer: &PeerId) -> Result<(), EngineError> {
        let (connected, in_range) = match self.registry.get(peer) {
            Some(r) => (r.is_connected(), r.can_interact()),
            None => (false, false),
        };
        if !connected {
            return Err(self.fail(EngineError::SendFailure {
                peer: peer.clone(),
                reason: TransportError::NotConnected(peer.clone()),
            }));
        }
        if self.config.enforce_proximity && !in_range {
            return Err(self.fail(EngineError::OutOfRange(peer.clone())));
        }
        let msg = Message::ThrillRequest {
            from: self.config.display_name.clone(),
        };
        self.send_message(peer, &msg)?;
        self.awaiting_response.insert(peer.clone());
        self.set_status(format!("Thrill sent to {}! Waiting for response...", peer));
        Ok(())
    }

    /// Answer a pending request. The request is consumed even if the send fails, so a
    /// request can never be resolved twice.
    pub fn respond_to_thrill_request(
        &mut self,
        request_id: RequestId,
        accepted: bool,
    ) -> Result<(), EngineError> {
        let Some(pos) = self.pending.iter().position(|r| r.id == request_id) else {
            return Err(self.fail(EngineError::UnknownRequest(request_id)));
        };
        let request = self.pending.remove(pos);
        self.events.push(Event::RequestResolved {
            request_id,
            peer_id: request.from_peer_id.clone(),
            accepted,
        });
        let msg = Message::ThrillResponse {
            accepted,
            from: self.config.display_name.clone(),
        };
        self.send_message(&request.from_peer_id, &msg)?;
        if accepted {
            self.set_status(format!("Accepted thrill from {}", request.from_name));
        } else {
            self.set_status(format!("Declined thrill from {}", request.from_name));
        }
        Ok(())
    }

    // ---- transport callbacks ----

    /// Browser saw a peer advertising our service: record it and invite it.
    pub fn on_peer_found(&mut self, peer: PeerId) {
        if !self.scanning {
            tracing::debug!("Ignoring {} found while not scanning", peer);
            return;
        }
        if self.linked.contains(&peer) {
            // The link outlived a discovery timeout; only the record went away.
            self.restore_linked_record(&peer);
            return;
        }
        let already_linking = matches!(
            self.registry.get(&peer).map(|r| r.connection_state),
            Some(ConnectionState::Connecting | ConnectionState::Connected)
        );
        if already_linking {
            return;
        }
        let upsert = self
            .registry
            .upsert_connection(&peer, ConnectionState::Connecting);
        self.emit_record(&peer, upsert);
        if let Err(e) = self.transport.connect(&peer) {
            tracing::warn!("Failed to invite {}: {}", peer, e);
            self.set_status(format!("Could not connect to {}", peer));
        }
    }

    pub fn on_peer_lost(&mut self, peer: &PeerId) {
        if self.registry.remove(peer).is_some() {
            self.events.push(Event::PeerLost(peer.clone()));
            self.set_status(format!("Lost connection to {}", peer));
        }
    }

    /// Decide on an incoming link invitation. Accepted while scanning.
    pub fn on_invitation(&mut self, peer: &PeerId) -> bool {
        if !self.scanning {
            tracing::debug!("Declining invitation from {}: not scanning", peer);
        }
        self.scanning
    }

    pub fn on_connection_state_changed(&mut self, peer: PeerId, state: ConnectionState) {
        if state == ConnectionState::Connected {
            self.linked.insert(peer.clone());
        } else {
            self.linked.remove(&peer);
        }
        let previous = self.registry.get(&peer).map(|r| r.connection_state);
        if previous == Some(state) {
            return;
        }
        if previous.is_none() && state == ConnectionState::Disconnected {
            self.forget_remote_token(&peer);
            return;
        }
        let upsert = self.registry.upsert_connection(&peer, state);
        match state {
            ConnectionState::Connecting => {
                self.set_status(format!("Connecting to {}...", peer));
            }
            ConnectionState::Connected => {
                self.set_status(format!("Connected to {}", peer));
                self.share_token(&peer);
            }
            ConnectionState::Disconnected => {
                self.forget_remote_token(&peer);
                self.awaiting_response.remove(&peer);
                self.set_status(format!("Disconnected from {}", peer));
            }
        }
        self.emit_record(&peer, upsert);
    }

    /// Interpret bytes from a peer. Undecodable payloads are logged and dropped.
    pub fn on_bytes_received(&mut self, peer: PeerId, bytes: &[u8]) {
        let msg = match protocol::decode(bytes) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!("Dropping {} bytes from {}: {}", bytes.len(), peer, e);
                return;
            }
        };
        match msg {
            Message::RangingTokenShare(token) => self.on_remote_token(peer, token),
            Message::ThrillRequest { from } => self.on_thrill_request(peer, from),
            Message::ThrillResponse { accepted, from } => {
                self.on_thrill_response(peer, from, accepted)
            }
        }
    }

    // ---- ranging callbacks ----

    pub fn on_ranging_sample(&mut self, sample: RangingSample) {
        if self.local_token.is_none() {
            tracing::debug!("Dropping ranging sample: session not running");
            return;
        }
        let Some(peer) = self.token_peers.get(&sample.token).cloned() else {
            tracing::debug!(
                "Dropping ranging sample for unknown token {}",
                sample.token.fingerprint()
            );
            return;
        };
        let was_in_range = self
            .registry
            .get(&peer)
            .map(|r| r.can_interact())
            .unwrap_or(false);
        let upsert = self
            .registry
            .upsert_ranging(&peer, sample.distance_m, sample.direction);
        if let Some(record) = self.registry.get(&peer) {
            if record.can_interact() != was_in_range {
                tracing::debug!(
                    "{} is now {} range",
                    peer,
                    if was_in_range { "out of" } else { "in" }
                );
            }
        }
        self.emit_record(&peer, upsert);
        let measured = self.registry.measured_count();
        if measured > 0 {
            self.set_status(format!("Found {} nearby user(s)", measured));
        }
    }

    /// Ranging lost sight of the peer behind `token`.
    pub fn on_ranging_removed(&mut self, token: &DiscoveryToken) {
        let Some(peer) = self.token_peers.get(token).cloned() else {
            return;
        };
        if self.registry.clear_ranging(&peer) {
            self.emit_record(&peer, Upsert::Updated);
            self.set_status(format!("{} moved out of range", peer));
        }
    }

    pub fn on_ranging_interrupted(&mut self, interruption: RangingInterruption) {
        match interruption {
            RangingInterruption::Suspended => self.set_status("Session suspended"),
            RangingInterruption::Resumed => self.set_status("Session resumed"),
            RangingInterruption::Invalidated(reason) => {
                tracing::warn!("Ranging session invalidated: {}", reason);
                self.ranging.stop();
                self.local_token = None;
                self.set_status(format!("Session error: {}", reason));
            }
        }
    }

    // ---- timers ----

    /// Withdraw pending requests older than the configured TTL.
    pub fn tick(&mut self, now: SystemTime) {
        let Some(ttl) = self.config.request_ttl else {
            return;
        };
        let (expired, kept): (Vec<ThrillRequest>, Vec<ThrillRequest>) =
            std::mem::take(&mut self.pending)
                .into_iter()
                .partition(|r| match now.duration_since(r.created_at) {
                    Ok(age) => age >= ttl,
                    Err(_) => false,
                });
        self.pending = kept;
        for request in expired {
            tracing::info!("Thrill {} from {} expired", request.id, request.from_peer_id);
            self.events.push(Event::RequestWithdrawn {
                request_id: request.id,
                peer_id: request.from_peer_id,
                reason: WithdrawReason::Expired,
            });
            self.set_status(format!("Thrill from {} expired", request.from_name));
        }
    }

    // ---- host accessors ----

    /// Drain queued events in the order they happened.
    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    pub fn local_token(&self) -> Option<&DiscoveryToken> {
        self.local_token.as_ref()
    }

    /// Token the peer shared with us, if any.
    pub fn remote_token(&self, peer: &PeerId) -> Option<&DiscoveryToken> {
        self.peer_tokens.get(peer)
    }

    pub fn pending_requests(&self) -> &[ThrillRequest] {
        &self.pending
    }

    pub fn awaiting_response(&self, peer: &PeerId) -> bool {
        self.awaiting_response.contains(peer)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn ranging(&self) -> &R {
        &self.ranging
    }

    pub fn ranging_mut(&mut self) -> &mut R {
        &mut self.ranging
    }

    // ---- internals ----

    fn on_remote_token(&mut self, peer: PeerId, token: DiscoveryToken) {
        tracing::debug!("Received ranging token {} from {}", token.fingerprint(), peer);
        self.forget_remote_token(&peer);
        self.token_peers.insert(token.clone(), peer.clone());
        self.peer_tokens.insert(peer.clone(), token.clone());
        if self.registry.get(&peer).is_none() && self.scanning {
            let upsert = self
                .registry
                .upsert_connection(&peer, ConnectionState::Connected);
            self.emit_record(&peer, upsert);
        }
        if self.local_token.is_none() {
            // Configured when discovery (re)starts.
            return;
        }
        if let Err(e) = self.ranging.configure_peer(&token) {
            let _ = self.fail(EngineError::Ranging(e));
        }
    }

    fn on_thrill_request(&mut self, peer: PeerId, from: String) {
        let has_pending = self.pending.iter().any(|r| r.from_peer_id == peer);
        if has_pending {
            match self.config.duplicate_policy {
                DuplicatePolicy::Reject => {
                    tracing::info!("Ignoring repeat thrill from {}: one is already pending", peer);
                    self.set_status(format!("Ignored repeat thrill from {}", from));
                    return;
                }
                DuplicatePolicy::Replace => {
                    let (old, kept): (Vec<ThrillRequest>, Vec<ThrillRequest>) =
                        std::mem::take(&mut self.pending)
                            .into_iter()
                            .partition(|r| r.from_peer_id == peer);
                    self.pending = kept;
                    for r in old {
                        self.events.push(Event::RequestWithdrawn {
                            request_id: r.id,
                            peer_id: r.from_peer_id,
                            reason: WithdrawReason::Superseded,
                        });
                    }
                }
                DuplicatePolicy::Queue => {}
            }
        }
        let request = ThrillRequest {
            id: RequestId::generate(),
            from_peer_id: peer,
            from_name: from,
            created_at: SystemTime::now(),
        };
        tracing::info!(
            "Thrill {} received from {} ({})",
            request.id,
            request.from_name,
            request.from_peer_id
        );
        self.pending.push(request.clone());
        self.set_status(format!("{} sent you a thrill!", request.from_name));
        self.events.push(Event::RequestReceived(request));
    }

    fn on_thrill_response(&mut self, peer: PeerId, from: String, accepted: bool) {
        if !self.awaiting_response.remove(&peer) {
            tracing::debug!("Unsolicited thrill response from {}", peer);
        }
        if accepted {
            self.set_status(format!("{} accepted! Chat started!", from));
        } else {
            self.set_status(format!("{} declined your request", from));
        }
        self.events.push(Event::ResponseReceived {
            peer_id: peer,
            responder: from,
            accepted,
        });
    }

    fn share_token(&mut self, peer: &PeerId) {
        let Some(token) = self.local_token.clone() else {
            tracing::debug!("Not sharing token with {}: ranging not running", peer);
            return;
        };
        if self
            .send_message(peer, &Message::RangingTokenShare(token))
            .is_ok()
        {
            tracing::debug!("Shared ranging token with {}", peer);
        }
    }

    /// After (re)starting ranging, bring peers whose links survived back into the registry
    /// and redo the token exchange with them.
    fn reattach_linked_peers(&mut self) {
        let linked: Vec<PeerId> = self.linked.iter().cloned().collect();
        for peer in linked {
            self.restore_linked_record(&peer);
            self.share_token(&peer);
            if let Some(token) = self.peer_tokens.get(&peer).cloned() {
                if let Err(e) = self.ranging.configure_peer(&token) {
                    let _ = self.fail(EngineError::Ranging(e));
                }
            }
        }
    }

    /// Mark a linked peer `Connected` in the registry, emitting only if that changed anything.
    fn restore_linked_record(&mut self, peer: &PeerId) {
        let state = self.registry.get(peer).map(|r| r.connection_state);
        if state == Some(ConnectionState::Connected) {
            return;
        }
        let upsert = self
            .registry
            .upsert_connection(peer, ConnectionState::Connected);
        self.emit_record(peer, upsert);
    }

    fn forget_remote_token(&mut self, peer: &PeerId) {
        if let Some(old) = self.peer_tokens.remove(peer) {
            self.token_peers.remove(&old);
        }
    }

    fn send_message(&mut self, peer: &PeerId, msg: &Message) -> Result<(), EngineError> {
        let bytes = match protocol::encode(msg) {
            Ok(b) => b,
            Err(e) => return Err(self.fail(EngineError::Encode(e))),
        };
        match self.transport.send(peer, bytes) {
            Ok(()) => Ok(()),
            Err(reason) => Err(self.fail(EngineError::SendFailure {
                peer: peer.clone(),
                reason,
            })),
        }
    }

    fn emit_record(&mut self, peer: &PeerId, upsert: Upsert) {
        if let Some(record) = self.registry.get(peer) {
            let record = record.clone();
            self.events.push(match upsert {
                Upsert::Created => Event::PeerDiscovered(record),
                Upsert::Updated => Event::PeerUpdated(record),
            });
        }
    }

    fn set_status(&mut self, text: impl Into<String>) {
        let text = text.into();
        if text != self.status {
            self.status = text.clone();
            self.events.push(Event::StatusChanged(text));
        }
    }

    /// Log an error and publish it as the status line.
    fn fail(&mut self, err: EngineError) -> EngineError {
        match &err {
            EngineError::UnknownRequest(_) => tracing::info!("{}", err),
            _ => tracing::warn!("{}", err),
        }
        self.set_status(err.to_string());
        err
    }
}

/// Local, non-fatal failures. Each one is also published as a status line.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Ranging not supported on this device")]
    UnsupportedPlatform,
    #[error("Failed to send to {peer}: {reason}")]
    SendFailure { peer: PeerId, reason: TransportError },
    #[error("Request {0} is no longer pending")]
    UnknownRequest(RequestId),
    #[error("{0} is not close enough")]
    OutOfRange(PeerId),
    #[error("Ranging error: {0}")]
    Ranging(RangingError),
    #[error("Discovery error: {0}")]
    Discovery(TransportError),
    #[error("Failed to encode message: {0}")]
    Encode(#[from] EncodeError),
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::{FakeRanging, FakeTransport};

    type Engine = ThrillEngine<FakeTransport, FakeRanging>;

    fn engine() -> Engine {
        engine_with(EngineConfig::new("Me"))
    }

    fn engine_with(config: EngineConfig) -> Engine {
        ThrillEngine::new(config, FakeTransport::default(), FakeRanging::supported())
    }

    fn id(s: &str) -> PeerId {
        PeerId::from(s)
    }

    /// Start discovery and bring `peer` to Connected, discarding the setup events and sends.
    fn connected(engine: &mut Engine, peer: &str) {
        engine.start_discovery().unwrap();
        engine.on_peer_found(id(peer));
        engine.on_connection_state_changed(id(peer), ConnectionState::Connected);
        engine.transport_mut().sent.clear();
        engine.take_events();
    }

    fn remote_token_from(engine: &mut Engine, peer: &str) -> DiscoveryToken {
        let token = DiscoveryToken::generate();
        let bytes = protocol::encode(&Message::RangingTokenShare(token.clone())).unwrap();
        engine.on_bytes_received(id(peer), &bytes);
        token
    }

    fn sample(token: &DiscoveryToken, d: f32) -> RangingSample {
        RangingSample {
            token: token.clone(),
            distance_m: Some(d),
            direction: None,
        }
    }

    fn received_requests(events: &[Event]) -> Vec<ThrillRequest> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::RequestReceived(r) => Some(r.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn start_requires_ranging_support() {
        let mut engine = ThrillEngine::new(
            EngineConfig::new("Me"),
            FakeTransport::default(),
            FakeRanging::unsupported(),
        );
        let err = engine.start_discovery().unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedPlatform));
        assert!(!engine.is_scanning());
        assert!(!engine.transport().advertising);
        assert!(engine
            .take_events()
            .contains(&Event::StatusChanged("Ranging not supported on this device".into())));
    }

    #[test]
    fn start_advertises_browses_and_mints_token() {
        let mut engine = engine();
        engine.start_discovery().unwrap();
        assert!(engine.is_scanning());
        assert!(engine.transport().advertising);
        assert!(engine.transport().browsing);
        assert_eq!(engine.transport().service_id.as_deref(), Some("insta-nearby"));
        let first = engine.local_token().cloned().unwrap();

        // Idempotent while running.
        engine.start_discovery().unwrap();
        assert_eq!(engine.ranging().starts, 1);

        engine.stop_discovery();
        assert!(engine.local_token().is_none());
        engine.start_discovery().unwrap();
        assert_ne!(engine.local_token().cloned().unwrap(), first);
    }

    #[test]
    fn advertise_failure_rolls_back() {
        let mut engine = engine();
        engine.transport_mut().fail_advertise = true;
        assert!(matches!(
            engine.start_discovery(),
            Err(EngineError::Discovery(_))
        ));
        assert!(!engine.is_scanning());
        assert!(!engine.ranging().running);
    }

    #[test]
    fn connect_shares_token_and_nothing_else() {
        let mut engine = engine();
        engine.start_discovery().unwrap();
        engine.on_peer_found(id("Mike"));
        assert_eq!(engine.transport().connects, vec![id("Mike")]);
        assert!(engine.transport().sent.is_empty());

        engine.on_connection_state_changed(id("Mike"), ConnectionState::Connected);
        let sent = &engine.transport().sent;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, id("Mike"));
        let local = engine.local_token().cloned().unwrap();
        assert_eq!(
            protocol::decode(&sent[0].1).unwrap(),
            Message::RangingTokenShare(local)
        );
        assert_eq!(
            engine.registry().get(&id("Mike")).unwrap().connection_state,
            ConnectionState::Connected
        );
    }

    #[test]
    fn connect_emits_discovered_then_updated() {
        let mut engine = engine();
        engine.start_discovery().unwrap();
        engine.take_events();
        engine.on_peer_found(id("Mike"));
        engine.on_connection_state_changed(id("Mike"), ConnectionState::Connected);
        let events = engine.take_events();
        assert!(matches!(events[0], Event::PeerDiscovered(ref r) if r.peer_id == id("Mike")));
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::PeerUpdated(r) if r.is_connected())));
        assert_eq!(engine.status(), "Connected to Mike");
    }

    #[test]
    fn repeated_state_is_ignored() {
        let mut engine = engine();
        connected(&mut engine, "Mike");
        engine.on_connection_state_changed(id("Mike"), ConnectionState::Connected);
        assert!(engine.transport().sent.is_empty());
        assert!(engine.take_events().is_empty());
    }

    #[test]
    fn incoming_request_is_tracked_once() {
        let mut engine = engine();
        engine.on_bytes_received(id("sarah-peer-7"), b"THRILL_REQUEST_FROM_Sarah");
        let events = engine.take_events();
        let requests = received_requests(&events);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].from_peer_id, id("sarah-peer-7"));
        assert_eq!(requests[0].from_name, "Sarah");
        assert_eq!(engine.pending_requests().len(), 1);
    }

    #[test]
    fn duplicate_rejected_by_default() {
        let mut engine = engine();
        engine.on_bytes_received(id("p"), b"THRILL_REQUEST_FROM_Sarah");
        let first = engine.pending_requests()[0].id;
        engine.take_events();
        engine.on_bytes_received(id("p"), b"THRILL_REQUEST_FROM_Sarah");
        assert!(received_requests(&engine.take_events()).is_empty());
        assert_eq!(engine.pending_requests().len(), 1);
        assert_eq!(engine.pending_requests()[0].id, first);
    }

    #[test]
    fn duplicate_replaced_when_configured() {
        let mut config = EngineConfig::new("Me");
        config.duplicate_policy = DuplicatePolicy::Replace;
        let mut engine = engine_with(config);
        engine.on_bytes_received(id("p"), b"THRILL_REQUEST_FROM_Sarah");
        let first = engine.pending_requests()[0].id;
        engine.take_events();
        engine.on_bytes_received(id("p"), b"THRILL_REQUEST_FROM_Sarah");
        let events = engine.take_events();
        assert!(events.contains(&Event::RequestWithdrawn {
            request_id: first,
            peer_id: id("p"),
            reason: WithdrawReason::Superseded,
        }));
        assert_eq!(received_requests(&events).len(), 1);
        assert_eq!(engine.pending_requests().len(), 1);
        assert_ne!(engine.pending_requests()[0].id, first);
    }

    #[test]
    fn duplicate_queued_when_configured() {
        let mut config = EngineConfig::new("Me");
        config.duplicate_policy = DuplicatePolicy::Queue;
        let mut engine = engine_with(config);
        engine.on_bytes_received(id("p"), b"THRILL_REQUEST_FROM_Sarah");
        engine.on_bytes_received(id("p"), b"THRILL_REQUEST_FROM_Sarah");
        assert_eq!(engine.pending_requests().len(), 2);
    }

    #[test]
    fn respond_sends_once_and_only_once() {
        let mut engine = engine();
        connected(&mut engine, "sarah-peer-7");
        engine.on_bytes_received(id("sarah-peer-7"), b"THRILL_REQUEST_FROM_Sarah");
        let request_id = engine.pending_requests()[0].id;
        engine.take_events();

        engine.respond_to_thrill_request(request_id, true).unwrap();
        assert_eq!(
            engine.transport().sent,
            vec![(id("sarah-peer-7"), b"THRILL_RESPONSE_ACCEPT_FROM_Me".to_vec())]
        );
        assert!(engine.take_events().contains(&Event::RequestResolved {
            request_id,
            peer_id: id("sarah-peer-7"),
            accepted: true,
        }));

        let err = engine.respond_to_thrill_request(request_id, false).unwrap_err();
        assert!(matches!(err, EngineError::UnknownRequest(r) if r == request_id));
        assert_eq!(engine.transport().sent.len(), 1);
        assert!(engine.pending_requests().is_empty());
    }

    #[test]
    fn unknown_request_is_a_benign_noop() {
        let mut engine = engine();
        let err = engine
            .respond_to_thrill_request(RequestId::generate(), true)
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownRequest(_)));
        assert!(engine.transport().sent.is_empty());
        assert!(engine.status().contains("no longer pending"));
    }

    #[test]
    fn decline_uses_decline_command() {
        let mut engine = engine();
        connected(&mut engine, "p");
        engine.on_bytes_received(id("p"), b"THRILL_REQUEST_FROM_Sarah");
        let request_id = engine.pending_requests()[0].id;
        engine.respond_to_thrill_request(request_id, false).unwrap();
        assert_eq!(
            engine.transport().sent[0].1,
            b"THRILL_RESPONSE_DECLINE_FROM_Me".to_vec()
        );
    }

    #[test]
    fn send_requires_connected_peer() {
        let mut engine = engine();
        engine.start_discovery().unwrap();
        engine.on_peer_found(id("Mike"));
        let err = engine.send_thrill_request(&id("Mike")).unwrap_err();
        assert!(matches!(err, EngineError::SendFailure { .. }));
        assert!(engine.transport().sent.is_empty());

        let err = engine.send_thrill_request(&id("nobody")).unwrap_err();
        assert!(matches!(err, EngineError::SendFailure { .. }));
        assert!(engine.transport().sent.is_empty());
    }

    #[test]
    fn send_trusts_caller_gating_by_default() {
        let mut engine = engine();
        connected(&mut engine, "Mike");
        engine.send_thrill_request(&id("Mike")).unwrap();
        assert_eq!(
            engine.transport().sent,
            vec![(id("Mike"), b"THRILL_REQUEST_FROM_Me".to_vec())]
        );
        assert!(engine.awaiting_response(&id("Mike")));
        assert_eq!(engine.status(), "Thrill sent to Mike! Waiting for response...");
    }

    #[test]
    fn enforced_proximity_blocks_far_peers() {
        let mut config = EngineConfig::new("Me");
        config.enforce_proximity = true;
        let mut engine = engine_with(config);
        connected(&mut engine, "Mike");
        let token = remote_token_from(&mut engine, "Mike");

        engine.on_ranging_sample(sample(&token, 4.0));
        assert!(matches!(
            engine.send_thrill_request(&id("Mike")),
            Err(EngineError::OutOfRange(_))
        ));
        assert!(engine.transport().sent.is_empty());

        engine.on_ranging_sample(sample(&token, 1.0));
        engine.send_thrill_request(&id("Mike")).unwrap();
        assert_eq!(engine.transport().sent.len(), 1);
    }

    #[test]
    fn transport_send_failure_is_reported() {
        let mut engine = engine();
        connected(&mut engine, "Mike");
        engine.transport_mut().unreachable.insert(id("Mike"));
        let err = engine.send_thrill_request(&id("Mike")).unwrap_err();
        assert!(matches!(err, EngineError::SendFailure { .. }));
        assert!(!engine.awaiting_response(&id("Mike")));
        assert!(engine.status().starts_with("Failed to send to Mike"));
    }

    #[test]
    fn remote_token_configures_ranging() {
        let mut engine = engine();
        connected(&mut engine, "Mike");
        let token = remote_token_from(&mut engine, "Mike");
        assert_eq!(engine.ranging().configured, vec![token.clone()]);
        assert_eq!(engine.remote_token(&id("Mike")), Some(&token));
    }

    #[test]
    fn crossing_threshold_flips_can_interact() {
        let mut engine = engine();
        connected(&mut engine, "Mike");
        let token = remote_token_from(&mut engine, "Mike");

        engine.on_ranging_sample(sample(&token, 4.0));
        assert!(!engine.registry().get(&id("Mike")).unwrap().can_interact());
        engine.take_events();

        engine.on_ranging_sample(sample(&token, 2.5));
        let events = engine.take_events();
        assert!(events.iter().any(|e| matches!(
            e,
            Event::PeerUpdated(r) if r.peer_id == id("Mike") && r.can_interact()
        )));
        assert!(engine.registry().get(&id("Mike")).unwrap().can_interact());
    }

    #[test]
    fn samples_are_attributed_by_token() {
        let mut engine = engine();
        connected(&mut engine, "Mike");
        engine.on_peer_found(id("Anna"));
        engine.on_connection_state_changed(id("Anna"), ConnectionState::Connected);
        let mike = remote_token_from(&mut engine, "Mike");
        let anna = remote_token_from(&mut engine, "Anna");

        engine.on_ranging_sample(sample(&anna, 1.2));
        engine.on_ranging_sample(sample(&mike, 7.5));

        let reg = engine.registry();
        assert_eq!(reg.get(&id("Anna")).unwrap().last_distance_m, Some(1.2));
        assert_eq!(reg.get(&id("Mike")).unwrap().last_distance_m, Some(7.5));
        assert_eq!(engine.status(), "Found 2 nearby user(s)");
    }

    #[test]
    fn unknown_token_sample_is_dropped() {
        let mut engine = engine();
        connected(&mut engine, "Mike");
        engine.on_ranging_sample(sample(&DiscoveryToken::generate(), 1.0));
        assert!(engine.take_events().is_empty());
        assert_eq!(engine.registry().get(&id("Mike")).unwrap().last_distance_m, None);
    }

    #[test]
    fn reshared_token_replaces_old_mapping() {
        let mut engine = engine();
        connected(&mut engine, "Mike");
        let old = remote_token_from(&mut engine, "Mike");
        let new = remote_token_from(&mut engine, "Mike");
        engine.on_ranging_sample(sample(&old, 1.0));
        assert_eq!(engine.registry().get(&id("Mike")).unwrap().last_distance_m, None);
        engine.on_ranging_sample(sample(&new, 1.0));
        assert_eq!(engine.registry().get(&id("Mike")).unwrap().last_distance_m, Some(1.0));
    }

    #[test]
    fn ranging_removal_clears_measurement() {
        let mut engine = engine();
        connected(&mut engine, "Mike");
        let token = remote_token_from(&mut engine, "Mike");
        engine.on_ranging_sample(sample(&token, 1.0));
        engine.on_ranging_removed(&token);
        assert!(!engine.registry().get(&id("Mike")).unwrap().can_interact());
        assert_eq!(engine.status(), "Mike moved out of range");
    }

    #[test]
    fn garbage_bytes_are_dropped_quietly() {
        let mut engine = engine();
        connected(&mut engine, "Mike");
        engine.on_bytes_received(id("Mike"), &[0xde, 0xad, 0xbe, 0xef]);
        engine.on_bytes_received(id("Mike"), b"THRILL_RESPONSE_SOMETHING");
        assert!(engine.take_events().is_empty());
        assert!(engine.ranging().configured.is_empty());
    }

    #[test]
    fn response_is_reported_with_responder_name() {
        let mut engine = engine();
        connected(&mut engine, "mike-peer");
        engine.send_thrill_request(&id("mike-peer")).unwrap();
        engine.take_events();
        engine.on_bytes_received(id("mike-peer"), b"THRILL_RESPONSE_DECLINE_FROM_Mike");
        let events = engine.take_events();
        assert!(events.contains(&Event::ResponseReceived {
            peer_id: id("mike-peer"),
            responder: "Mike".into(),
            accepted: false,
        }));
        assert_eq!(engine.status(), "Mike declined your request");
        assert!(!engine.awaiting_response(&id("mike-peer")));
    }

    #[test]
    fn stop_clears_registry_but_keeps_pending_requests() {
        let mut engine = engine();
        connected(&mut engine, "sarah-peer-7");
        engine.on_bytes_received(id("sarah-peer-7"), b"THRILL_REQUEST_FROM_Sarah");
        engine.take_events();

        engine.stop_discovery();
        let events = engine.take_events();
        assert!(events.contains(&Event::PeerLost(id("sarah-peer-7"))));
        assert!(!events
            .iter()
            .any(|e| matches!(e, Event::RequestResolved { .. } | Event::RequestWithdrawn { .. })));
        assert!(engine.registry().is_empty());
        assert_eq!(engine.pending_requests().len(), 1);
        assert!(engine.local_token().is_none());
        assert!(!engine.transport().advertising);
        assert!(!engine.transport().browsing);
        assert!(!engine.ranging().running);

        // Second stop changes nothing.
        engine.stop_discovery();
        assert!(engine.take_events().is_empty());
    }

    #[test]
    fn restart_reshares_with_surviving_links() {
        let mut engine = engine();
        connected(&mut engine, "Mike");
        let remote = remote_token_from(&mut engine, "Mike");
        engine.stop_discovery();
        engine.transport_mut().sent.clear();
        engine.ranging_mut().configured.clear();

        engine.start_discovery().unwrap();
        let local = engine.local_token().cloned().unwrap();
        assert_eq!(
            engine.transport().sent,
            vec![(
                id("Mike"),
                protocol::encode(&Message::RangingTokenShare(local)).unwrap()
            )]
        );
        assert_eq!(engine.ranging().configured, vec![remote]);
        assert!(engine.registry().get(&id("Mike")).unwrap().is_connected());
    }

    #[test]
    fn pending_requests_expire_after_ttl() {
        let mut config = EngineConfig::new("Me");
        config.request_ttl = Some(Duration::from_secs(30));
        let mut engine = engine_with(config);
        engine.on_bytes_received(id("p"), b"THRILL_REQUEST_FROM_Sarah");
        let request = engine.pending_requests()[0].clone();
        engine.take_events();

        engine.tick(request.created_at + Duration::from_secs(10));
        assert_eq!(engine.pending_requests().len(), 1);

        engine.tick(request.created_at + Duration::from_secs(31));
        assert!(engine.pending_requests().is_empty());
        assert!(engine.take_events().contains(&Event::RequestWithdrawn {
            request_id: request.id,
            peer_id: id("p"),
            reason: WithdrawReason::Expired,
        }));
        assert!(matches!(
            engine.respond_to_thrill_request(request.id, true),
            Err(EngineError::UnknownRequest(_))
        ));
    }

    #[test]
    fn ttl_disabled_keeps_requests() {
        let mut config = EngineConfig::new("Me");
        config.request_ttl = None;
        let mut engine = engine_with(config);
        engine.on_bytes_received(id("p"), b"THRILL_REQUEST_FROM_Sarah");
        let created = engine.pending_requests()[0].created_at;
        engine.tick(created + Duration::from_secs(86_400));
        assert_eq!(engine.pending_requests().len(), 1);
    }

    #[test]
    fn invalidated_session_needs_restart() {
        let mut engine = engine();
        connected(&mut engine, "Mike");
        let token = remote_token_from(&mut engine, "Mike");
        engine.on_ranging_interrupted(RangingInterruption::Invalidated("hardware gone".into()));
        assert!(engine.local_token().is_none());
        assert_eq!(engine.status(), "Session error: hardware gone");

        engine.on_ranging_sample(sample(&token, 1.0));
        assert_eq!(engine.registry().get(&id("Mike")).unwrap().last_distance_m, None);

        engine.start_discovery().unwrap();
        assert!(engine.local_token().is_some());
        assert_eq!(engine.ranging().starts, 2);
    }

    #[test]
    fn invitations_follow_scanning_state() {
        let mut engine = engine();
        assert!(!engine.on_invitation(&id("Mike")));
        engine.start_discovery().unwrap();
        assert!(engine.on_invitation(&id("Mike")));
    }

    #[test]
    fn disconnect_forgets_token() {
        let mut engine = engine();
        connected(&mut engine, "Mike");
        let token = remote_token_from(&mut engine, "Mike");
        engine.on_connection_state_changed(id("Mike"), ConnectionState::Disconnected);
        assert!(engine.remote_token(&id("Mike")).is_none());
        engine.on_ranging_sample(sample(&token, 1.0));
        assert!(!engine.registry().get(&id("Mike")).unwrap().can_interact());
        assert_eq!(engine.status(), "Disconnected from Mike");
    }

    #[test]
    fn lost_peer_is_removed() {
        let mut engine = engine();
        connected(&mut engine, "Mike");
        engine.on_peer_lost(&id("Mike"));
        assert!(engine.registry().get(&id("Mike")).is_none());
        assert!(engine.take_events().contains(&Event::PeerLost(id("Mike"))));
        assert_eq!(engine.status(), "Lost connection to Mike");
    }

    #[test]
    fn refound_peer_on_live_link_is_reachable() {
        let mut engine = engine();
        connected(&mut engine, "Mike");
        let token = remote_token_from(&mut engine, "Mike");
        engine.on_peer_lost(&id("Mike"));
        engine.take_events();

        engine.on_peer_found(id("Mike"));
        let record = engine.registry().get(&id("Mike")).cloned().unwrap();
        assert!(record.is_connected());
        let events = engine.take_events();
        assert!(events.contains(&Event::PeerDiscovered(record)));
        // No second invitation over a link that is already up.
        assert_eq!(engine.transport().connects, vec![id("Mike")]);

        engine.send_thrill_request(&id("Mike")).unwrap();
        assert_eq!(
            engine.transport().sent.last().map(|(p, b)| (p.clone(), b.clone())),
            Some((id("Mike"), b"THRILL_REQUEST_FROM_Me".to_vec()))
        );
        engine.on_ranging_sample(sample(&token, 1.0));
        assert!(engine.registry().get(&id("Mike")).unwrap().can_interact());
    }

    #[test]
    fn restart_after_invalidation_is_quiet_for_connected_peers() {
        let mut engine = engine();
        connected(&mut engine, "Mike");
        engine.on_ranging_interrupted(RangingInterruption::Invalidated("hardware gone".into()));
        engine.take_events();

        engine.start_discovery().unwrap();
        let events = engine.take_events();
        assert!(!events
            .iter()
            .any(|e| matches!(e, Event::PeerUpdated(_) | Event::PeerDiscovered(_))));
        assert!(engine.registry().get(&id("Mike")).unwrap().is_connected());
    }
}
