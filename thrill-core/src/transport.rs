//! Transport seam: local-mesh discovery plus a reliable byte channel per peer.
//!
//! Implementations must not block. Inbound traffic (peer found/lost, invitations,
//! connection state, received bytes) is delivered by the host to the engine's `on_*` methods.

use crate::identity::PeerId;

pub trait Transport {
    /// Announce local presence under `service_id`.
    fn advertise(&mut self, service_id: &str) -> Result<(), TransportError>;

    /// Look for remote presence under `service_id`.
    fn browse(&mut self, service_id: &str) -> Result<(), TransportError>;

    fn stop_advertising(&mut self);

    fn stop_browsing(&mut self);

    /// Invite a discovered peer into the session. Completion arrives as a connection state change.
    fn connect(&mut self, peer: &PeerId) -> Result<(), TransportError>;

    /// Queue bytes for reliable delivery. Returns once queued, not once delivered.
    fn send(&mut self, peer: &PeerId, bytes: Vec<u8>) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("peer {0} is not connected")]
    NotConnected(PeerId),
    #[error("no known address for peer {0}")]
    UnknownPeer(PeerId),
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}
