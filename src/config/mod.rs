//! Configuration management for dagcache

pub mod schema;

pub use schema::{CacheSettings, Config, LogSettings, StoreSettings};

use crate::error::{CacheError, CacheResult};
use crate::store::{ExpirationStore, FileExpirationStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info};

const STORE_FILE: &str = "expirations.json";

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
        }
    }

    /// Create a config manager with a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("dagcache")
            .join("config.toml")
    }

    /// Expiration store path for a loaded config. Unset means the per-user
    /// state directory.
    pub fn store_path(config: &Config) -> PathBuf {
        config.store.path.clone().unwrap_or_else(|| {
            dirs::state_dir()
                .or_else(dirs::data_local_dir)
                .unwrap_or_else(|| PathBuf::from("."))
                .join("dagcache")
                .join(STORE_FILE)
        })
    }

    /// Expiration store described by `config`, or `None` when disabled
    pub fn open_store(config: &Config) -> Option<Arc<dyn ExpirationStore>> {
        if !config.store.enabled {
            debug!("Expiration store disabled");
            return None;
        }
        Some(Arc::new(FileExpirationStore::new(Self::store_path(config))))
    }

    /// Load configuration, using defaults if the file does not exist
    pub async fn load(&self) -> CacheResult<Config> {
        let path = &self.config_path;
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Config::default());
        }

        let content = fs::read_to_string(path)
            .await
            .map_err(|e| CacheError::io(format!("reading config from {}", path.display()), e))?;
        toml::from_str(&content).map_err(|e| CacheError::ConfigInvalid {
            path: path.clone(),
            reason: e.to_string(),
        })
    }

    /// Save configuration to file
    pub async fn save(&self, config: &Config) -> CacheResult<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                CacheError::io(format!("creating directory {}", parent.display()), e)
            })?;
        }

        let content = toml::to_string_pretty(config)?;
        fs::write(&self.config_path, content).await.map_err(|e| {
            CacheError::io(
                format!("writing config to {}", self.config_path.display()),
                e,
            )
        })?;

        info!("Configuration saved to {}", self.config_path.display());
        Ok(())
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}
