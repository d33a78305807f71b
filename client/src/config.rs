//! Client configuration, assembled from flags and environment.

use std::time::Duration;

use anyhow::Result;
use mcptunnel_shared::bus::{WsBus, WsBusConfig, DEFAULT_CONNECT_TIMEOUT_MS};
use mcptunnel_shared::protocol::{DEFAULT_NAMESPACE, DEFAULT_TIMEOUT_MS};

/// Default bus hub: a relay on this machine hosting the bus.
pub const DEFAULT_BUS_URL: &str = "ws://localhost:8080/bus";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Hub to connect to
    pub bus_url: String,

    /// Shared bus credential
    pub bus_key: Option<String>,

    pub namespace: String,

    /// Tenant whose relay performs the calls
    pub tenant_id: String,

    /// Per-call timeout
    pub timeout: Duration,

    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bus_url: DEFAULT_BUS_URL.to_string(),
            bus_key: None,
            namespace: DEFAULT_NAMESPACE.to_string(),
            tenant_id: String::new(),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
        }
    }
}

impl ClientConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.tenant_id.trim().is_empty() {
            anyhow::bail!("tenant id is required (--tenant-id or TENANT_ID)");
        }
        if self.tenant_id.contains(':') {
            anyhow::bail!("tenant id must not contain ':'");
        }
        if !(self.bus_url.starts_with("ws://") || self.bus_url.starts_with("wss://")) {
            anyhow::bail!("bus url must use ws:// or wss://, got '{}'", self.bus_url);
        }
        if self.timeout.is_zero() {
            anyhow::bail!("timeout must be greater than 0");
        }
        Ok(())
    }

    pub fn bus(&self) -> WsBus {
        WsBus::new(
            WsBusConfig::new(self.bus_url.clone())
                .with_api_key(self.bus_key.clone())
                .with_connect_timeout(self.connect_timeout),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.bus_url, "ws://localhost:8080/bus");
        assert_eq!(config.namespace, "mcp-tunnel");
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_validation() {
        let mut config = ClientConfig::default();
        assert!(config.validate().is_err(), "tenant id is required");

        config.tenant_id = "t1".into();
        config.validate().unwrap();

        config.timeout = Duration::ZERO;
        assert!(config.validate().is_err());
        config.timeout = Duration::from_millis(10);

        config.bus_url = "https://bus.example.com".into();
        assert!(config.validate().is_err());
    }
}
