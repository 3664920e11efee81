//! Configuration schema for dagcache
//!
//! Configuration is stored at `~/.config/dagcache/config.toml`

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// In-memory cache settings
    pub cache: CacheSettings,

    /// Persisted expiration store
    pub store: StoreSettings,

    /// Logging settings
    pub log: LogSettings,
}

/// Cache tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Seconds between sweeps of expired TTL records
    pub sweep_interval_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 600,
        }
    }
}

/// Expiration store settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Persist TTL metadata to disk
    pub enabled: bool,

    /// Store file; defaults to the state directory
    pub path: Option<PathBuf>,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Log format: "text" or "json"
    pub format: String,

    /// Default level when no -v flag is given
    pub level: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            format: "text".to_string(),
            level: "warn".to_string(),
        }
    }
}
