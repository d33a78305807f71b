//! Relay configuration.
//!
//! Values come from an optional `relay.yml`, then command-line flags and
//! environment variables override individual fields.

use std::path::Path;

use anyhow::{Context, Result};
use mcptunnel_shared::bus::DEFAULT_CONNECT_TIMEOUT_MS;
use mcptunnel_shared::protocol::{DEFAULT_MAX_REQUEST_SIZE, DEFAULT_NAMESPACE};
use serde::{Deserialize, Serialize};

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    /// Tenant whose request topic this relay serves
    #[serde(default)]
    pub tenant_id: String,

    #[serde(default)]
    pub bus: BusConfig,

    /// Destination host patterns (empty = allow all)
    #[serde(default)]
    pub allowed_hosts: Vec<String>,

    /// Wildcard patterns only admit real subdomains
    #[serde(default)]
    pub strict_wildcards: bool,

    /// Maximum decoded request body in bytes
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Port for health, readiness, metrics and the bus hub
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Message bus settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BusConfig {
    /// External hub to join. When unset the relay hosts the bus itself.
    pub url: Option<String>,

    /// Shared bus credential
    pub key: Option<String>,

    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: None,
            key: None,
            namespace: default_namespace(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

/// Per-tenant sliding window
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_limit")]
    pub requests: usize,

    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests: default_rate_limit(),
            window_ms: default_window_ms(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            tenant_id: String::new(),
            bus: BusConfig::default(),
            allowed_hosts: Vec::new(),
            strict_wildcards: false,
            max_request_size: default_max_request_size(),
            rate_limit: RateLimitConfig::default(),
            port: default_port(),
        }
    }
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_max_request_size() -> usize {
    DEFAULT_MAX_REQUEST_SIZE
}

fn default_rate_limit() -> usize {
    100
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_port() -> u16 {
    8080
}

impl RelayConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.tenant_id.trim().is_empty() {
            anyhow::bail!("tenant id is required (--tenant-id or TENANT_ID)");
        }
        if self.tenant_id.contains(':') {
            anyhow::bail!("tenant id must not contain ':'");
        }
        if self.bus.namespace.is_empty() || self.bus.namespace.contains(':') {
            anyhow::bail!("invalid bus namespace '{}'", self.bus.namespace);
        }
        if self.rate_limit.requests == 0 {
            anyhow::bail!("rate limit must be at least 1 request per window");
        }
        if self.rate_limit.window_ms == 0 {
            anyhow::bail!("rate limit window must be greater than 0");
        }
        if self.max_request_size == 0 {
            anyhow::bail!("max request size must be greater than 0");
        }
        if let Some(url) = &self.bus.url {
            if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                anyhow::bail!("bus url must use ws:// or wss://, got '{}'", url);
            }
        }
        Ok(())
    }

    /// Search for a config file in the working directory
    pub fn find_config() -> Option<std::path::PathBuf> {
        ["relay.yml", "relay.yaml", "mcptunnel-relay.yml"]
            .iter()
            .map(std::path::PathBuf::from)
            .find(|p| p.exists())
    }
}
