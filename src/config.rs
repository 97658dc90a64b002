//! Configuration
//!
//! Runtime settings for both roles. Every field has a default so a YAML file
//! only needs to name what it changes; command-line flags are applied on top.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

fn parse_addr(what: &str, addr: &str) -> Result<SocketAddr> {
    addr.parse()
        .map_err(|e| Error::Configuration(format!("Invalid {} address {}: {}", what, addr, e)))
}

// =============================================================================
// Controller
// =============================================================================

/// Settings of the controller process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Satellite connection bind address
    pub listen_addr: String,
    /// Health server bind address
    pub health_addr: String,
    /// Metrics server bind address
    pub metrics_addr: String,
    /// Resolve the connecting node by its remote address
    pub match_peer_address: bool,
    /// Seconds between pings to authenticated peers
    pub keepalive_interval_secs: u64,
    /// Seconds without a pong before a peer is closed
    pub keepalive_timeout_secs: u64,
    /// Seconds between redelivery attempts
    pub retry_interval_secs: u64,
    /// Seconds to wait for the answer to a call
    pub call_timeout_secs: u64,
    /// Send the full sync as a call and wait for the capability report
    pub full_sync_awaits_response: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3370".to_string(),
            health_addr: "0.0.0.0:8081".to_string(),
            metrics_addr: "0.0.0.0:8080".to_string(),
            match_peer_address: true,
            keepalive_interval_secs: 5,
            keepalive_timeout_secs: 20,
            retry_interval_secs: 10,
            call_timeout_secs: 30,
            full_sync_awaits_response: true,
        }
    }
}

impl ControllerConfig {
    /// Load from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_yaml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.listen()?;
        if self.keepalive_interval_secs == 0 {
            return Err(Error::Configuration(
                "keepalive_interval_secs must be positive".into(),
            ));
        }
        if self.keepalive_timeout_secs <= self.keepalive_interval_secs {
            return Err(Error::Configuration(format!(
                "keepalive_timeout_secs ({}) must exceed keepalive_interval_secs ({})",
                self.keepalive_timeout_secs, self.keepalive_interval_secs
            )));
        }
        if self.retry_interval_secs == 0 {
            return Err(Error::Configuration(
                "retry_interval_secs must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn listen(&self) -> Result<SocketAddr> {
        parse_addr("listen", &self.listen_addr)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

// =============================================================================
// Satellite
// =============================================================================

/// Settings of a satellite process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SatelliteConfig {
    /// Name this satellite authenticates as
    pub node_name: String,
    /// Controller address to dial
    pub controller_addr: String,
    /// Connect attempt timeout in seconds
    pub connect_timeout_secs: u64,
    /// First reconnect delay in milliseconds
    pub reconnect_initial_ms: u64,
    /// Upper bound of the reconnect delay in seconds
    pub reconnect_max_secs: u64,
    /// Device layers reported as supported
    pub supported_layers: Vec<String>,
    /// Storage providers reported as supported
    pub supported_providers: Vec<String>,
    /// Health server bind address
    pub health_addr: String,
}

impl Default for SatelliteConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            controller_addr: "127.0.0.1:3370".to_string(),
            connect_timeout_secs: 10,
            reconnect_initial_ms: 500,
            reconnect_max_secs: 30,
            supported_layers: vec!["STORAGE".to_string()],
            supported_providers: vec!["DISKLESS".to_string()],
            health_addr: "0.0.0.0:8082".to_string(),
        }
    }
}

impl SatelliteConfig {
    /// Load from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_yaml::from_str(&text)?;
        Ok(config)
    }

    /// Checked once the command line has been applied
    pub fn validate(&self) -> Result<()> {
        if self.node_name.trim().is_empty() {
            return Err(Error::Configuration("node_name is required".into()));
        }
        self.controller()?;
        if self.reconnect_initial_ms == 0 {
            return Err(Error::Configuration(
                "reconnect_initial_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn controller(&self) -> Result<SocketAddr> {
        parse_addr("controller", &self.controller_addr)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_secs(self.reconnect_max_secs)
    }
}
