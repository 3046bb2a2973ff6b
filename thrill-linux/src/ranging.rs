//! Ranging backend for hosts without ranging hardware: distances are typed in by hand.

use std::collections::HashSet;

use thrill_core::{DiscoveryToken, Ranging, RangingError, RangingSample};

pub struct ManualRanging {
    supported: bool,
    local: Option<DiscoveryToken>,
    remotes: HashSet<DiscoveryToken>,
}

impl ManualRanging {
    pub fn new() -> Self {
        Self {
            supported: true,
            local: None,
            remotes: HashSet::new(),
        }
    }

    /// A backend that reports ranging as unavailable.
    pub fn unsupported() -> Self {
        Self {
            supported: false,
            ..Self::new()
        }
    }

    /// Build a sample for a configured peer, as real hardware would report it.
    pub fn sample(
        &self,
        remote: &DiscoveryToken,
        distance_m: f32,
        direction: Option<[f32; 3]>,
    ) -> Result<RangingSample, RangingError> {
        if self.local.is_none() {
            return Err(RangingError::NotRunning);
        }
        if !self.remotes.contains(remote) {
            return Err(RangingError::Backend(format!(
                "token {} is not configured",
                remote.fingerprint()
            )));
        }
        if !distance_m.is_finite() || distance_m < 0.0 {
            return Err(RangingError::Backend(format!("invalid distance {}", distance_m)));
        }
        Ok(RangingSample {
            token: remote.clone(),
            distance_m: Some(distance_m),
            direction,
        })
    }
}

impl Ranging for ManualRanging {
    fn is_supported(&self) -> bool {
        self.supported
    }

    fn start(&mut self) -> Result<DiscoveryToken, RangingError> {
        if !self.supported {
            return Err(RangingError::Unsupported);
        }
        let token = DiscoveryToken::generate();
        self.remotes.clear();
        self.local = Some(token.clone());
        tracing::debug!("Manual ranging session {}", token.fingerprint());
        Ok(token)
    }

    fn configure_peer(&mut self, remote: &DiscoveryToken) -> Result<(), RangingError> {
        if self.local.is_none() {
            return Err(RangingError::NotRunning);
        }
        self.remotes.insert(remote.clone());
        Ok(())
    }

    fn stop(&mut self) {
        self.local = None;
        self.remotes.clear();
    }
}
