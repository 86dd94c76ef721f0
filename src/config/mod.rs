//! Agent configuration
//!
//! The binary consumes a single JSON configuration file describing queue
//! sizes, thread idle times, persistency location and quota, raw data buffer
//! quotas, and the transport endpoint. Loaded once at startup and passed
//! down explicitly; components never reach for a global.
//!
//! ## Loading order
//!
//! 1. `--config <path>` CLI argument
//! 2. `FLEETLINK_CONFIG` environment variable
//! 3. `fleetlink-config.json` in the current working directory

mod validation;

pub use validation::validate;

use crate::types::SignalId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors are fatal at startup (process exit code 1).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("config read failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse failed: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// Bounded signal pipeline capacity (samples).
    #[serde(default = "defaults::signal_pipeline_size")]
    pub signal_pipeline_size: usize,

    /// Upper bound on the inspection engine's queue wait so cancellation
    /// and time-based triggers are noticed in quiescent periods (ms).
    #[serde(default = "defaults::inspection_idle_time_ms")]
    pub inspection_idle_time_ms: u64,

    /// Upper bound on the campaign manager's deadline wait (ms). Also the
    /// re-check cadence after wall-clock jumps.
    #[serde(default = "defaults::campaign_manager_idle_time_ms")]
    pub collection_scheme_manager_idle_time_ms: u64,

    /// Checkin reporting period (ms).
    #[serde(default = "defaults::checkin_interval_ms")]
    pub checkin_interval_ms: u64,

    /// Uploader drain period (ms).
    #[serde(default = "defaults::uploader_interval_ms")]
    pub uploader_interval_ms: u64,

    /// Control-plane document poll period (ms).
    #[serde(default = "defaults::document_poll_interval_ms")]
    pub document_poll_interval_ms: u64,

    /// Cap on triggered payloads buffered between engine and uploader.
    #[serde(default = "defaults::upload_queue_size")]
    pub upload_queue_size: usize,

    pub transport: TransportConfig,

    pub persistency: PersistencyConfig,

    #[serde(default)]
    pub raw_data_buffer: RawDataBufferConfig,
}

/// Cloud transport endpoint and credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransportConfig {
    /// Broker bridge endpoint, e.g. "https://ingest.example.com".
    pub endpoint: String,
    /// Stable identity of this vehicle agent.
    pub client_id: String,
    /// Bearer credential for the bridge.
    #[serde(default)]
    pub api_key: String,
    /// Per-call deadline inherited by all transport operations (ms).
    #[serde(default = "defaults::transport_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// On-disk persistence location and quota.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PersistencyConfig {
    /// Directory for persisted documents and payloads.
    pub path: PathBuf,
    /// Single byte budget across all persisted blobs.
    #[serde(default = "defaults::persistency_max_bytes")]
    pub max_bytes: u64,
}

/// Raw data buffer quotas, configured at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawDataBufferConfig {
    /// Cap across all signals, applied after per-signal reserved bytes.
    #[serde(default = "defaults::raw_buffer_global_max_bytes")]
    pub global_max_bytes: u64,
    /// Per-signal quota entries. Signals without an entry cannot store
    /// complex payloads.
    #[serde(default)]
    pub signals: Vec<RawSignalBufferConfig>,
}

/// Per-signal raw buffer quota.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawSignalBufferConfig {
    pub signal_id: SignalId,
    /// Bytes carved out of the global budget for this signal alone.
    #[serde(default)]
    pub reserved_bytes: u64,
    /// Hard cap on bytes held for this signal.
    pub max_bytes: u64,
    /// Hard cap on frame count held for this signal.
    pub max_samples: u32,
    /// Single frames larger than this are rejected outright.
    pub max_bytes_per_sample: u64,
}

mod defaults {
    pub fn signal_pipeline_size() -> usize {
        10_000
    }
    pub fn inspection_idle_time_ms() -> u64 {
        1_000
    }
    pub fn campaign_manager_idle_time_ms() -> u64 {
        1_000
    }
    pub fn checkin_interval_ms() -> u64 {
        60_000
    }
    pub fn uploader_interval_ms() -> u64 {
        10_000
    }
    pub fn document_poll_interval_ms() -> u64 {
        10_000
    }
    pub fn upload_queue_size() -> usize {
        100
    }
    pub fn transport_timeout_ms() -> u64 {
        30_000
    }
    pub fn persistency_max_bytes() -> u64 {
        512 * 1024
    }
    pub fn raw_buffer_global_max_bytes() -> u64 {
        64 * 1024 * 1024
    }
}

impl AgentConfig {
    /// Load and validate a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let raw = std::fs::read_to_string(path)?;
        let config: AgentConfig = serde_json::from_str(&raw)?;
        validate(&config)?;

        tracing::info!(
            path = %path.display(),
            pipeline_size = config.signal_pipeline_size,
            checkin_interval_ms = config.checkin_interval_ms,
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Resolve the config path from CLI arg, env var, or working directory.
    pub fn resolve_path(cli_path: Option<PathBuf>) -> PathBuf {
        if let Some(path) = cli_path {
            return path;
        }
        if let Ok(env_path) = std::env::var("FLEETLINK_CONFIG") {
            return PathBuf::from(env_path);
        }
        PathBuf::from("fleetlink-config.json")
    }

    /// Raw buffer quota entry for a signal, if one exists.
    pub fn raw_signal_config(&self, signal_id: SignalId) -> Option<&RawSignalBufferConfig> {
        self.raw_data_buffer
            .signals
            .iter()
            .find(|s| s.signal_id == signal_id)
    }
}
