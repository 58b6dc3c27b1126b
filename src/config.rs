//! Configuration management for crawlqueue using the prefer crate.

use std::fs;
use std::path::{Path, PathBuf};

use prefer::ConfigValue;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{SchedulerError, SchedulerResult};
use crate::models::{JobDescription, RepositoryConnection};
use crate::scheduler::performance::{DEFAULT_FETCH_RATE, DEFAULT_WEIGHTS};
use crate::scheduler::queue_tracker::DEFAULT_MIN_MS_PER_FETCH;
use crate::scheduler::reprioritization::DEFAULT_LEASE_MS;

/// Scheduler settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Base data directory.
    pub data_dir: PathBuf,
    /// Database filename.
    pub database_filename: String,
    /// Identity of this process for crash-recovery ownership.
    pub process_id: String,
    /// Throttle scale constant (ms) of the priority engine.
    pub min_ms_per_fetch: f64,
    /// Fetch-rate weights, most recent sample first.
    pub performance_weights: Vec<f64>,
    /// Fetch rate (docs/minute) assumed for connections with no history.
    pub default_fetch_rate: f64,
    /// Stuffing cadence and throttle budget interval.
    pub stuffer_interval_ms: u64,
    /// Maximum documents claimed per stuffing call.
    pub stuffer_batch_size: usize,
    /// Ready candidates read per claimable slot.
    pub candidate_multiplier: usize,
    /// Concurrent fetch workers.
    pub worker_count: usize,
    /// Counted document failures tolerated before the job aborts.
    pub max_document_failures: u32,
    /// Hard-fail window opened by a document's first counted failure.
    pub failure_window_ms: i64,
    /// Base backoff after a counted failure.
    pub retry_backoff_ms: i64,
    /// Backoff ceiling.
    pub max_retry_backoff_ms: i64,
    /// Reprioritization lease length.
    pub reprioritization_lease_ms: i64,
    /// Retries of a whole transaction on transient conflicts.
    pub transaction_retries: u32,
    /// Documents claimed per delete or cleanup call.
    pub delete_batch_size: usize,
    /// Documents prioritized per stuffing cycle.
    pub priority_batch_size: usize,
}

/// Generate a process id from the host name and a random suffix.
pub fn default_process_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", host, &suffix[..8])
}

impl Default for Settings {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")))
            .join("crawlqueue");

        Self {
            data_dir,
            database_filename: "crawlqueue.db".to_string(),
            process_id: default_process_id(),
            min_ms_per_fetch: DEFAULT_MIN_MS_PER_FETCH,
            performance_weights: DEFAULT_WEIGHTS.to_vec(),
            default_fetch_rate: DEFAULT_FETCH_RATE,
            stuffer_interval_ms: 2000,
            stuffer_batch_size: 100,
            candidate_multiplier: 4,
            worker_count: 16,
            max_document_failures: 10,
            failure_window_ms: 3_600_000,
            retry_backoff_ms: 60_000,
            max_retry_backoff_ms: 3_600_000,
            reprioritization_lease_ms: DEFAULT_LEASE_MS,
            transaction_retries: 5,
            delete_batch_size: 50,
            priority_batch_size: 200,
        }
    }
}

impl Settings {
    /// Create settings with a custom data directory.
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            ..Default::default()
        }
    }

    /// Get the full path to the database.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_filename)
    }

    /// Ensure all directories exist.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }

    /// Backoff before retrying a document after its `fail_count`-th counted failure.
    pub fn retry_backoff(&self, fail_count: u32) -> i64 {
        let exponent = fail_count.saturating_sub(1).min(30);
        self.retry_backoff_ms
            .saturating_mul(1_i64 << exponent)
            .min(self.max_retry_backoff_ms)
    }
}

/// Configuration file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Target directory for data.
    #[serde(default)]
    pub target: Option<String>,
    /// Database filename.
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub process_id: Option<String>,
    #[serde(default)]
    pub min_ms_per_fetch: Option<f64>,
    #[serde(default)]
    pub performance_weights: Option<Vec<f64>>,
    #[serde(default)]
    pub default_fetch_rate: Option<f64>,
    #[serde(default)]
    pub stuffer_interval_ms: Option<u64>,
    #[serde(default)]
    pub stuffer_batch_size: Option<usize>,
    #[serde(default)]
    pub worker_count: Option<usize>,
    #[serde(default)]
    pub max_document_failures: Option<u32>,
    #[serde(default)]
    pub failure_window_ms: Option<i64>,
    #[serde(default)]
    pub retry_backoff_ms: Option<i64>,
    #[serde(default)]
    pub reprioritization_lease_ms: Option<i64>,
    /// Repository connections.
    #[serde(default)]
    pub connections: Vec<RepositoryConnection>,
    /// Job definitions.
    #[serde(default)]
    pub jobs: Vec<JobDescription>,
}

impl Config {
    /// Load configuration using prefer crate.
    /// Automatically discovers crawlqueue config files in standard locations.
    /// `CRAWLQUEUE_CONFIG`, when set, names an explicit JSON file instead.
    pub async fn load() -> Self {
        if let Ok(path) = std::env::var("CRAWLQUEUE_CONFIG") {
            match Self::from_path(Path::new(&path)) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!("Ignoring config file {}: {}", path, e);
                    return Self::default();
                }
            }
        }
        match prefer::load("crawlqueue").await {
            Ok(pref_config) => Config {
                target: pref_config.get("target").ok(),
                database: pref_config.get("database").ok(),
                process_id: pref_config.get("process_id").ok(),
                min_ms_per_fetch: pref_config.get("min_ms_per_fetch").ok(),
                performance_weights: pref_config.get("performance_weights").ok(),
                default_fetch_rate: pref_config.get("default_fetch_rate").ok(),
                stuffer_interval_ms: pref_config.get("stuffer_interval_ms").ok(),
                stuffer_batch_size: pref_config.get("stuffer_batch_size").ok(),
                worker_count: pref_config.get("worker_count").ok(),
                max_document_failures: pref_config.get("max_document_failures").ok(),
                failure_window_ms: pref_config.get("failure_window_ms").ok(),
                retry_backoff_ms: pref_config.get("retry_backoff_ms").ok(),
                reprioritization_lease_ms: pref_config.get("reprioritization_lease_ms").ok(),
                connections: structured(&pref_config, "connections"),
                jobs: structured(&pref_config, "jobs"),
            },
            Err(_) => {
                // No config file found, use defaults
                Self::default()
            }
        }
    }

    /// Read a JSON configuration file.
    pub fn from_path(path: &Path) -> SchedulerResult<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| SchedulerError::Config(format!("{}: {}", path.display(), e)))?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Apply configuration to settings.
    pub fn apply_to_settings(&self, settings: &mut Settings) {
        if let Some(ref target) = self.target {
            let path = shellexpand::tilde(target);
            settings.data_dir = PathBuf::from(path.as_ref());
        }
        if let Some(ref database) = self.database {
            settings.database_filename = database.clone();
        }
        if let Some(ref process_id) = self.process_id {
            settings.process_id = process_id.clone();
        }
        if let Some(value) = self.min_ms_per_fetch {
            settings.min_ms_per_fetch = value;
        }
        if let Some(ref weights) = self.performance_weights {
            if !weights.is_empty() {
                settings.performance_weights = weights.clone();
            }
        }
        if let Some(rate) = self.default_fetch_rate {
            settings.default_fetch_rate = rate;
        }
        if let Some(interval) = self.stuffer_interval_ms {
            settings.stuffer_interval_ms = interval;
        }
        if let Some(size) = self.stuffer_batch_size {
            settings.stuffer_batch_size = size;
        }
        if let Some(count) = self.worker_count {
            settings.worker_count = count.max(1);
        }
        if let Some(failures) = self.max_document_failures {
            settings.max_document_failures = failures;
        }
        if let Some(window) = self.failure_window_ms {
            settings.failure_window_ms = window;
        }
        if let Some(backoff) = self.retry_backoff_ms {
            settings.retry_backoff_ms = backoff;
        }
        if let Some(lease) = self.reprioritization_lease_ms {
            settings.reprioritization_lease_ms = lease;
        }
    }
}

/// Read a list of serde structures from a prefer key.
///
/// prefer only converts scalars and containers, so nested tables go through
/// `serde_json::Value`. A malformed list is logged and ignored.
fn structured<T: DeserializeOwned>(config: &prefer::Config, key: &str) -> Vec<T> {
    let Ok(value) = config.get_value(key) else {
        return Vec::new();
    };
    match serde_json::from_value(to_json(value)) {
        Ok(items) => items,
        Err(e) => {
            tracing::warn!("Ignoring config key {}: {}", key, e);
            Vec::new()
        }
    }
}

fn to_json(value: &ConfigValue) -> serde_json::Value {
    match value {
        ConfigValue::Null => serde_json::Value::Null,
        ConfigValue::Bool(b) => serde_json::Value::Bool(*b),
        ConfigValue::Integer(i) => serde_json::Value::from(*i),
        ConfigValue::Float(f) => serde_json::Value::from(*f),
        ConfigValue::String(s) => serde_json::Value::String(s.clone()),
        ConfigValue::Array(items) => serde_json::Value::Array(items.iter().map(to_json).collect()),
        ConfigValue::Object(map) => serde_json::Value::Object(
            map.iter().map(|(k, v)| (k.clone(), to_json(v))).collect(),
        ),
    }
}

/// Load settings from configuration (async version).
pub async fn load_settings() -> Settings {
    let config = Config::load().await;
    let mut settings = Settings::default();
    config.apply_to_settings(&mut settings);
    settings
}
