//! Ranging seam: continuous distance/direction to peers.
//!
//! Every sample carries the remote token the backend was configured with, so the engine
//! can attribute it to exactly one peer no matter how many are connected.

use crate::identity::DiscoveryToken;

pub trait Ranging {
    fn is_supported(&self) -> bool;

    /// Start (or restart) the local session and return its fresh token.
    fn start(&mut self) -> Result<DiscoveryToken, RangingError>;

    /// Begin ranging against the peer that shared `remote`.
    fn configure_peer(&mut self, remote: &DiscoveryToken) -> Result<(), RangingError>;

    /// Invalidate the session. Idempotent; the local token is dead afterwards.
    fn stop(&mut self);
}

/// One measurement from the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct RangingSample {
    /// The remote token this measurement was configured with.
    pub token: DiscoveryToken,
    pub distance_m: Option<f32>,
    pub direction: Option<[f32; 3]>,
}

/// Session-level notifications that are not tied to one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangingInterruption {
    Suspended,
    Resumed,
    Invalidated(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RangingError {
    #[error("ranging is not supported on this device")]
    Unsupported,
    #[error("ranging session is not running")]
    NotRunning,
    #[error("ranging backend failed: {0}")]
    Backend(String),
}
