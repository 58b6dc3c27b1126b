//! Repository connection definitions.

use serde::{Deserialize, Serialize};

/// Throttle rule: bins whose name matches `bin_regex` are limited to `max_fetches_per_minute`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottleSpec {
    pub bin_regex: String,
    pub max_fetches_per_minute: f64,
}

impl ThrottleSpec {
    pub fn new(bin_regex: &str, max_fetches_per_minute: f64) -> Self {
        Self {
            bin_regex: bin_regex.to_string(),
            max_fetches_per_minute,
        }
    }

    /// Rate in fetches per millisecond.
    pub fn max_rate_per_ms(&self) -> f64 {
        self.max_fetches_per_minute / 60_000.0
    }
}

/// A configured connection to a repository, served by one registered connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryConnection {
    pub name: String,
    /// Stable id of the connector implementation in the registry.
    pub connector_id: String,
    #[serde(default)]
    pub throttles: Vec<ThrottleSpec>,
    /// Maximum documents in flight for this connection at once.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_max_connections() -> usize {
    10
}

impl RepositoryConnection {
    pub fn new(name: &str, connector_id: &str) -> Self {
        Self {
            name: name.to_string(),
            connector_id: connector_id.to_string(),
            throttles: Vec::new(),
            max_connections: default_max_connections(),
        }
    }

    pub fn with_throttle(mut self, bin_regex: &str, max_fetches_per_minute: f64) -> Self {
        self.throttles
            .push(ThrottleSpec::new(bin_regex, max_fetches_per_minute));
        self
    }
}
