//! Identifiers: peer names, ranging discovery tokens, request ids.

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Remote endpoint identifier: the transport's display name for the peer.
/// Only unique within one registry; no authentication is implied.
#[derive(Debug, Clone, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(name: impl Into<String>) -> Self {
        PeerId(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_owned())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        PeerId(s)
    }
}

/// Default token length produced by [`DiscoveryToken::generate`].
pub const TOKEN_LEN: usize = 32;

/// Opaque ranging token. A peer needs ours before it can range against us.
/// Regenerated every time the local ranging session restarts.
#[derive(Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct DiscoveryToken(Vec<u8>);

impl DiscoveryToken {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        DiscoveryToken(bytes)
    }

    /// Fresh random token, for ranging backends without their own token format.
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; TOKEN_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        DiscoveryToken(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Short hex digest for logs; never print the token itself.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(&self.0);
        digest[..4].iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Debug for DiscoveryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DiscoveryToken({})", self.fingerprint())
    }
}

/// Locally synthesized id for an incoming thrill request. Never sent on the wire.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct RequestId(uuid::Uuid);

impl RequestId {
    pub fn generate() -> Self {
        RequestId(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for RequestId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::parse_str(s).map(RequestId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_differ() {
        let a = DiscoveryToken::generate();
        let b = DiscoveryToken::generate();
        assert_eq!(a.as_bytes().len(), TOKEN_LEN);
        assert_ne!(a, b);
    }

    #[test]
    fn fingerprint_is_stable_and_short() {
        let t = DiscoveryToken::from_bytes(vec![1, 2, 3]);
        assert_eq!(t.fingerprint(), t.clone().fingerprint());
        assert_eq!(t.fingerprint().len(), 8);
        assert!(!format!("{:?}", t).contains("[1, 2, 3]"));
    }

    #[test]
    fn request_id_parses_back() {
        let id = RequestId::generate();
        let parsed: RequestId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }
}
