//! Application directory paths.
//!
//! Uses the [`dirs`] crate for platform-appropriate locations.
//!
//! | Purpose | macOS | Linux |
//! |---------|-------|-------|
//! | Data | `~/Library/Application Support/duewatch/` | `~/.local/share/duewatch/` |
//! | Config | `~/Library/Application Support/duewatch/` | `~/.config/duewatch/` |
//!
//! # Environment Overrides
//!
//! - `DUEWATCH_DATA_DIR` overrides [`data_dir`]
//! - `DUEWATCH_CONFIG_DIR` overrides [`config_dir`]

use std::path::PathBuf;

/// Directory holding the task store.
#[must_use]
pub fn data_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("DUEWATCH_DATA_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::data_dir()
        .map(|d| d.join("duewatch"))
        .unwrap_or_else(|| PathBuf::from("/tmp/duewatch-data"))
}

/// Directory holding `config.toml`.
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("DUEWATCH_CONFIG_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::config_dir()
        .map(|d| d.join("duewatch"))
        .unwrap_or_else(|| PathBuf::from("/tmp/duewatch-config"))
}

/// Default configuration file.
#[must_use]
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}
