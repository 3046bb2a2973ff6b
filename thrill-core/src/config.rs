//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Service identifier shared by every participating device.
pub const DEFAULT_SERVICE_ID: &str = "insta-nearby";

/// Default lifetime of an unanswered incoming request.
pub const DEFAULT_REQUEST_TTL: Duration = Duration::from_secs(120);

/// What to do when a peer sends a second request while its first is still pending.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Drop the new request; the pending one stands.
    #[default]
    Reject,
    /// Withdraw the pending one and keep the new request.
    Replace,
    /// Keep both.
    Queue,
}

impl std::str::FromStr for DuplicatePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "reject" => Ok(DuplicatePolicy::Reject),
            "replace" => Ok(DuplicatePolicy::Replace),
            "queue" => Ok(DuplicatePolicy::Queue),
            other => Err(format!("unknown duplicate policy '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Our name as sent in `THRILL_*_FROM_<name>`.
    pub display_name: String,
    pub service_id: String,
    pub duplicate_policy: DuplicatePolicy,
    /// `None` keeps requests pending until answered.
    pub request_ttl: Option<Duration>,
    /// Re-check `can_interact` before sending a request instead of trusting the caller.
    pub enforce_proximity: bool,
}

impl EngineConfig {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            ..Self::default()
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            display_name: "thrill-device".to_owned(),
            service_id: DEFAULT_SERVICE_ID.to_owned(),
            duplicate_policy: DuplicatePolicy::default(),
            request_ttl: Some(DEFAULT_REQUEST_TTL),
            enforce_proximity: false,
        }
    }
}
