//! Node Configuration
//!
//! TOML file plus environment overrides. The file is located by
//! [`ConfigLoader`]:
//!
//! 1. `REALM_AUTH_CONFIG_DIR/<file>`
//! 2. `./<file>`
//! 3. `<crate root>/config/<file>`

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::network::{ConnectionSettings, ServerConfig, TrustTier};

/// Environment variable naming the config directory.
pub const CONFIG_DIR_ENV: &str = "REALM_AUTH_CONFIG_DIR";

/// Overrides `limits.handshake_timeout_secs`.
pub const HANDSHAKE_TIMEOUT_ENV: &str = "REALM_AUTH_HANDSHAKE_TIMEOUT_SECS";

/// Overrides `limits.max_connections`.
pub const MAX_CONNECTIONS_ENV: &str = "REALM_AUTH_MAX_CONNECTIONS";

/// Finds and parses TOML config files.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Locate `relative_path` and parse it.
    pub fn parse_from_file<T: DeserializeOwned>(relative_path: &str) -> anyhow::Result<T> {
        let path = Self::resolve_path(relative_path)?;
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        Self::parse_from_str(&text)
            .with_context(|| format!("invalid config at {}", path.display()))
    }

    /// Parse TOML text.
    pub fn parse_from_str<T: DeserializeOwned>(text: &str) -> anyhow::Result<T> {
        toml::from_str(text).context("failed to parse TOML")
    }

    fn resolve_path(relative_path: &str) -> anyhow::Result<PathBuf> {
        let rel = Path::new(relative_path);

        if let Some(root) = env::var_os(CONFIG_DIR_ENV) {
            let candidate = PathBuf::from(root).join(rel);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }

        if let Ok(cwd) = env::current_dir() {
            let candidate = cwd.join(rel);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }

        let candidate = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("config")
            .join(rel);
        if candidate.is_file() {
            return Ok(candidate);
        }

        anyhow::bail!("config file not found for {:?}", rel);
    }
}

/// One listening tier.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerSection {
    /// Tier served.
    pub tier: TrustTier,
    /// Bind address. Defaults to all interfaces on the tier's port.
    #[serde(default)]
    pub bind: Option<String>,
}

impl ListenerSection {
    /// Bind address with the tier default applied.
    pub fn bind_addr(&self) -> String {
        self.bind
            .clone()
            .unwrap_or_else(|| format!("0.0.0.0:{}", self.tier.default_port()))
    }
}

/// Upstream tier this node authenticates to.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamSection {
    /// Tier of the upstream link.
    pub tier: TrustTier,
    /// Upstream host.
    pub host: String,
    /// Upstream port. Defaults to the tier's port.
    #[serde(default)]
    pub port: Option<u16>,
    /// Identity presented upstream.
    pub identity: String,
    /// Password for `identity`.
    pub password: String,
}

impl UpstreamSection {
    /// Port with the tier default applied.
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.tier.default_port())
    }
}

/// Account seeded into the in-memory store.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountSection {
    /// Login identity.
    pub identity: String,
    /// Cleartext password; only the verifier is kept.
    pub password: String,
}

/// Connection limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsSection {
    /// Seconds an unauthenticated connection may stay open.
    pub handshake_timeout_secs: u64,
    /// Failed logon rounds per connection.
    pub max_auth_attempts: u32,
    /// Live connections per listener.
    pub max_connections: usize,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: 30,
            max_auth_attempts: 3,
            max_connections: 1000,
        }
    }
}

/// Whole node configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Tiers served by this node.
    pub listeners: Vec<ListenerSection>,
    /// Optional upstream link.
    pub upstream: Option<UpstreamSection>,
    /// Seed accounts.
    pub accounts: Vec<AccountSection>,
    /// Limits.
    pub limits: LimitsSection,
}

impl NodeConfig {
    /// Load `relative_path` and apply environment overrides.
    pub fn load(relative_path: &str) -> anyhow::Result<Self> {
        let mut config: Self = ConfigLoader::parse_from_file(relative_path)?;
        config.apply_env()?;
        Ok(config)
    }

    /// Apply `REALM_AUTH_*` overrides.
    pub fn apply_env(&mut self) -> anyhow::Result<()> {
        if let Ok(value) = env::var(HANDSHAKE_TIMEOUT_ENV) {
            self.limits.handshake_timeout_secs = value
                .parse()
                .with_context(|| format!("{HANDSHAKE_TIMEOUT_ENV}={value:?} is not a number"))?;
        }
        if let Ok(value) = env::var(MAX_CONNECTIONS_ENV) {
            self.limits.max_connections = value
                .parse()
                .with_context(|| format!("{MAX_CONNECTIONS_ENV}={value:?} is not a number"))?;
        }
        Ok(())
    }

    /// Handshake timeout as a duration.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.limits.handshake_timeout_secs)
    }

    /// Per-connection settings.
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            handshake_timeout: self.handshake_timeout(),
        }
    }

    /// Server settings for one listener.
    pub fn server_config(&self, listener: &ListenerSection) -> ServerConfig {
        ServerConfig {
            bind_addr: listener.bind_addr(),
            max_connections: self.limits.max_connections,
            handshake_timeout: self.handshake_timeout(),
            max_auth_attempts: self.limits.max_auth_attempts,
        }
    }
}
