//! Thrill core: peer-to-peer proximity requests.
//!
//! Host-driven: this crate does no I/O. The host implements [`Transport`] and [`Ranging`],
//! feeds their callbacks into a [`ThrillEngine`], and drains [`Event`]s for its UI.

pub mod config;
pub mod engine;
pub mod identity;
pub mod link;
pub mod protocol;
pub mod ranging;
pub mod registry;
pub mod transport;
pub mod wire;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{DuplicatePolicy, EngineConfig};
pub use engine::{EngineError, Event, ThrillEngine, ThrillRequest, WithdrawReason};
pub use identity::{DiscoveryToken, PeerId, RequestId};
pub use protocol::Message;
pub use ranging::{Ranging, RangingError, RangingInterruption, RangingSample};
pub use registry::{ConnectionState, PeerRecord, PeerRegistry, PROXIMITY_THRESHOLD_M};
pub use transport::{Transport, TransportError};
