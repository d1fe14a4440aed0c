//! Configuration for the tracker.
//!
//! Settings live in `tasksync.yaml` inside the data directory. Every field
//! has a default, so a missing file (or a partial one) is fine.

use crate::error::Result;
use crate::persistence::{GatewayOptions, DEFAULT_CAPACITY_BYTES, DEFAULT_ENVELOPE_KEY};
use crate::sync::{SyncOptions, DEFAULT_MAX_ATTEMPTS, DEFAULT_OUTBOX_KEY};
use crate::tasks::{StoreOptions, DEFAULT_RETENTION_DAYS};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file name inside the data directory.
pub const CONFIG_FILE_NAME: &str = "tasksync.yaml";

/// Tracker configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct TrackerConfig {
    /// Local persistence settings.
    pub storage: StorageConfig,
    /// Remote sync settings.
    pub sync: SyncConfig,
}

/// Local persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    /// Host key for the task envelope.
    pub key: String,
    /// Debounce window for physical writes, in milliseconds.
    pub debounce_ms: u64,
    /// How long a cached read stays fresh, in milliseconds.
    pub cache_ttl_ms: u64,
    /// Byte ceiling of the host store.
    pub capacity_bytes: u64,
    /// Days a soft-deleted task is kept before it may be purged.
    pub retention_days: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let gateway = GatewayOptions::default();
        Self {
            key: DEFAULT_ENVELOPE_KEY.to_string(),
            debounce_ms: duration_millis(gateway.debounce),
            cache_ttl_ms: duration_millis(gateway.cache_ttl),
            capacity_bytes: DEFAULT_CAPACITY_BYTES,
            retention_days: u32::try_from(DEFAULT_RETENTION_DAYS).unwrap_or(30),
        }
    }
}

/// Remote sync settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncConfig {
    /// Seconds between periodic syncs.
    pub interval_secs: u64,
    /// Failed pushes before an operation is abandoned.
    pub max_attempts: u32,
    /// Base URL of the remote task service. No sync without one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Host key for the persisted outbox.
    pub outbox_key: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: SyncOptions::default().interval.as_secs(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            endpoint: None,
            outbox_key: DEFAULT_OUTBOX_KEY.to_string(),
        }
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl TrackerConfig {
    /// Load config from a data directory, falling back to defaults if the
    /// file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(data_dir: &Path) -> Result<Self> {
        let config_path = Self::config_path(data_dir);
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&config_path)?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save config to a data directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save_to(&self, data_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(data_dir)?;
        let content = serde_yaml::to_string(self)?;
        std::fs::write(Self::config_path(data_dir), content)?;
        Ok(())
    }

    /// Get the config file path for a data directory.
    #[must_use]
    pub fn config_path(data_dir: &Path) -> PathBuf {
        data_dir.join(CONFIG_FILE_NAME)
    }

    /// Options for the persistence gateway.
    #[must_use]
    pub fn gateway_options(&self) -> GatewayOptions {
        GatewayOptions {
            key: self.storage.key.clone(),
            debounce: Duration::from_millis(self.storage.debounce_ms),
            cache_ttl: Duration::from_millis(self.storage.cache_ttl_ms),
        }
    }

    /// Options for the task store.
    #[must_use]
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions { retention: chrono::Duration::days(i64::from(self.storage.retention_days)) }
    }

    /// Options for the sync engine.
    #[must_use]
    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            interval: Duration::from_secs(self.sync.interval_secs.max(1)),
            max_attempts: self.sync.max_attempts.max(1),
            outbox_key: self.sync.outbox_key.clone(),
        }
    }
}
