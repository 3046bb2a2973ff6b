//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;
use thrill_core::{DuplicatePolicy, EngineConfig};

/// Daemon configuration. File: ~/.config/thrill/config.toml or /etc/thrill/config.toml.
/// Env overrides: THRILL_NAME, THRILL_SERVICE, THRILL_DISCOVERY_PORT, THRILL_TRANSPORT_PORT,
/// THRILL_REQUEST_TTL_SECS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Name shown to peers; also our peer id on their side.
    #[serde(default = "default_display_name")]
    pub display_name: String,
    #[serde(default = "default_service_id")]
    pub service_id: String,
    /// Discovery UDP port (default 45690).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Link TCP port (default 45691).
    #[serde(default = "default_transport_port")]
    pub transport_port: u16,
    #[serde(default)]
    pub duplicate_policy: DuplicatePolicy,
    /// 0 keeps requests until answered.
    #[serde(default = "default_request_ttl_secs")]
    pub request_ttl_secs: u64,
    #[serde(default)]
    pub enforce_proximity: bool,
    #[serde(default)]
    pub ranging: RangingBackend,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RangingBackend {
    /// Samples typed in on the console.
    #[default]
    Manual,
    /// Report ranging as unsupported.
    None,
}

fn default_display_name() -> String {
    match std::env::var("USER") {
        Ok(user) if !user.is_empty() => user,
        _ => format!("thrill-{:04x}", rand::random::<u16>()),
    }
}
fn default_service_id() -> String {
    thrill_core::config::DEFAULT_SERVICE_ID.to_owned()
}
fn default_discovery_port() -> u16 {
    45690
}
fn default_transport_port() -> u16 {
    45691
}
fn default_request_ttl_secs() -> u64 {
    thrill_core::config::DEFAULT_REQUEST_TTL.as_secs()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            display_name: default_display_name(),
            service_id: default_service_id(),
            discovery_port: default_discovery_port(),
            transport_port: default_transport_port(),
            duplicate_policy: DuplicatePolicy::default(),
            request_ttl_secs: default_request_ttl_secs(),
            enforce_proximity: false,
            ranging: RangingBackend::default(),
        }
    }
}

impl Config {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            display_name: self.display_name.clone(),
            service_id: self.service_id.clone(),
            duplicate_policy: self.duplicate_policy,
            request_ttl: (self.request_ttl_secs > 0)
                .then(|| Duration::from_secs(self.request_ttl_secs)),
            enforce_proximity: self.enforce_proximity,
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.display_name.trim().is_empty() {
            bail!("display_name must not be empty");
        }
        if self.display_name.len() > usize::from(u16::MAX) {
            bail!("display_name is too long");
        }
        if self.service_id.is_empty() {
            bail!("service_id must not be empty");
        }
        if self.discovery_port == self.transport_port {
            bail!("discovery_port and transport_port must differ");
        }
        Ok(())
    }
}

/// Load config: default, then the config file (explicit path, or the first default path
/// that exists), then env vars, then `name` from the command line.
pub fn load(explicit: Option<&Path>, name: Option<String>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(p) => read_file(p)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => read_file(&p)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |k| std::env::var(k).ok());
    if let Some(name) = name {
        c.display_name = name;
    }
    c.validate()?;
    Ok(c)
}

fn read_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let c = toml::from_str::<Config>(&s).with_context(|| format!("parsing {}", path.display()))?;
    tracing::info!("Loaded config from {}", path.display());
    Ok(c)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("THRILL_NAME") {
        c.display_name = s;
    }
    if let Some(s) = var("THRILL_SERVICE") {
        c.service_id = s;
    }
    if let Some(s) = var("THRILL_DISCOVERY_PORT") {
        match s.parse::<u16>() {
            Ok(p) => c.discovery_port = p,
            Err(_) => tracing::warn!("Ignoring THRILL_DISCOVERY_PORT={}", s),
        }
    }
    if let Some(s) = var("THRILL_TRANSPORT_PORT") {
        match s.parse::<u16>() {
            Ok(p) => c.transport_port = p,
            Err(_) => tracing::warn!("Ignoring THRILL_TRANSPORT_PORT={}", s),
        }
    }
    if let Some(s) = var("THRILL_REQUEST_TTL_SECS") {
        match s.parse::<u64>() {
            Ok(t) => c.request_ttl_secs = t,
            Err(_) => tracing::warn!("Ignoring THRILL_REQUEST_TTL_SECS={}", s),
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/thrill/config.toml"));
    }
    out.push(PathBuf::from("/etc/thrill/config.toml"));
    out
}
