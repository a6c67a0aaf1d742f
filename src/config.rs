//! Configuration for the task tracker.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::alert::{ALERT_TITLE, Permission};
use crate::store::StoreOptions;
use crate::tasks::DEFAULT_STORE_NAME;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Where and how tasks are stored.
    pub store: StoreConfig,
    /// Deadline check scheduling.
    pub watcher: WatcherConfig,
    /// Alert presentation.
    pub alerts: AlertConfig,
}

/// Store location and timeouts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the store files.
    pub data_dir: PathBuf,
    /// Store name; the file is `<data_dir>/<name>.db`.
    pub name: String,
    /// How long a transaction waits for the write lock.
    pub busy_timeout_ms: u64,
    /// How long an upgrade waits for other handles to close.
    pub blocked_timeout_ms: u64,
    /// Upper bound on a deadline scan's transaction.
    pub transaction_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: crate::paths::data_dir(),
            name: DEFAULT_STORE_NAME.to_owned(),
            busy_timeout_ms: 5_000,
            blocked_timeout_ms: 1_000,
            transaction_timeout_ms: 30_000,
        }
    }
}

impl StoreConfig {
    pub fn options(&self) -> StoreOptions {
        StoreOptions {
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
            blocked_timeout: Duration::from_millis(self.blocked_timeout_ms),
        }
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }
}

/// Trigger intervals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Foreground poll interval.
    pub poll_interval_secs: u64,
    /// Background check interval.
    pub background_interval_secs: u64,
    /// Delay before the single retry of a failed background check.
    pub retry_delay_secs: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            background_interval_secs: 60,
            retry_delay_secs: 5,
        }
    }
}

/// Alert settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub title: String,
    /// Notification permission state.
    pub permission: Permission,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            title: ALERT_TITLE.to_owned(),
            permission: Permission::Granted,
        }
    }
}

impl TrackerConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::TrackerError::Config(e.to_string()))
    }

    /// Load `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: &std::path::Path) -> crate::error::Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::TrackerError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `<config dir>/config.toml`.
    pub fn default_config_path() -> PathBuf {
        crate::paths::config_file()
    }
}
