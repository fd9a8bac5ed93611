//! Bus-level configuration.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::qos::cache::CacheManagerConfig;
use crate::qos::circuit_breaker::CircuitBreakerConfig;
use crate::qos::reliable::ReliableMessagingConfig;
use crate::qos::throttling::ThrottlingConfig;

/// Configuration for a bus instance and all of its QoS modules.
///
/// Every field has a default, so a partial JSON document is a valid config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Identifier of this bus node, used in logs.
    pub node_id: String,
    /// Default thresholds for per-service circuit breakers.
    pub circuit_breaker: CircuitBreakerConfig,
    pub throttling: ThrottlingConfig,
    pub reliable: ReliableMessagingConfig,
    pub cache: CacheManagerConfig,
    /// Upper bound for draining in-flight requests and stopping background
    /// workers at shutdown, in milliseconds.
    pub shutdown_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            node_id: "relaybus-node".to_string(),
            circuit_breaker: CircuitBreakerConfig::default(),
            throttling: ThrottlingConfig::default(),
            reliable: ReliableMessagingConfig::default(),
            cache: CacheManagerConfig::default(),
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl BusConfig {
    /// Reads a JSON config file. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid JSON.
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))
    }
}
