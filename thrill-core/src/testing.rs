//! In-memory collaborators for engine tests.

use std::collections::HashSet;

use crate::identity::{DiscoveryToken, PeerId};
use crate::ranging::{Ranging, RangingError};
use crate::transport::{Transport, TransportError};

#[derive(Debug, Default)]
pub struct FakeTransport {
    pub service_id: Option<String>,
    pub advertising: bool,
    pub browsing: bool,
    pub fail_advertise: bool,
    pub connects: Vec<PeerId>,
    pub sent: Vec<(PeerId, Vec<u8>)>,
    /// Sends to these peers fail.
    pub unreachable: HashSet<PeerId>,
}

impl Transport for FakeTransport {
    fn advertise(&mut self, service_id: &str) -> Result<(), TransportError> {
        if self.fail_advertise {
            return Err(TransportError::Unavailable("advertiser refused".into()));
        }
        self.service_id = Some(service_id.to_owned());
        self.advertising = true;
        Ok(())
    }

    fn browse(&mut self, _service_id: &str) -> Result<(), TransportError> {
        self.browsing = true;
        Ok(())
    }

    fn stop_advertising(&mut self) {
        self.advertising = false;
    }

    fn stop_browsing(&mut self) {
        self.browsing = false;
    }

    fn connect(&mut self, peer: &PeerId) -> Result<(), TransportError> {
        self.connects.push(peer.clone());
        Ok(())
    }

    fn send(&mut self, peer: &PeerId, bytes: Vec<u8>) -> Result<(), TransportError> {
        if self.unreachable.contains(peer) {
            return Err(TransportError::NotConnected(peer.clone()));
        }
        self.sent.push((peer.clone(), bytes));
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FakeRanging {
    pub supported: bool,
    pub running: bool,
    pub starts: usize,
    pub configured: Vec<DiscoveryToken>,
}

impl FakeRanging {
    pub fn supported() -> Self {
        Self {
            supported: true,
            ..Self::default()
        }
    }

    pub fn unsupported() -> Self {
        Self::default()
    }
}

impl Ranging for FakeRanging {
    fn is_supported(&self) -> bool {
        self.supported
    }

    fn start(&mut self) -> Result<DiscoveryToken, RangingError> {
        if !self.supported {
            return Err(RangingError::Unsupported);
        }
        self.running = true;
        self.starts += 1;
        Ok(DiscoveryToken::generate())
    }

    fn configure_peer(&mut self, remote: &DiscoveryToken) -> Result<(), RangingError> {
        if !self.running {
            return Err(RangingError::NotRunning);
        }
        self.configured.push(remote.clone());
        Ok(())
    }

    fn stop(&mut self) {
        self.running = false;
    }
}
