//! Configuration
//!
//! Tunables for paging, caching, prefetching and transfers, read from a
//! TOML file. Every field has a default so partial files are valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment variable overriding the configuration directory
pub const CONFIG_DIR_ENV: &str = "SM_CONFIG_DIR";

const CONFIG_FILE_NAME: &str = "config.toml";

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub browser: BrowserConfig,
    pub cache: CacheConfig,
    pub prefetch: PrefetchConfig,
    pub transfers: TransferConfig,
}

/// Listing presentation settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    /// Rows per listing page, also used as `max_keys` for remote pages
    pub page_size: usize,

    /// Folder delimiter
    pub delimiter: String,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            page_size: 200,
            delimiter: "/".to_string(),
        }
    }
}

/// Listing cache settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 600,
            sweep_interval_secs: 60,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Bucket prefetch settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    /// Child prefixes of the bucket root to warm
    pub max_children: usize,

    /// Concurrent prefetch listings
    pub concurrency: usize,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            max_children: 8,
            concurrency: 3,
        }
    }
}

/// Transfer queue settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub max_concurrent: usize,

    /// Seconds a completed transfer stays in the visible list
    pub completed_retention_secs: u64,

    /// File count above which a folder upload needs confirmation
    pub large_folder_threshold: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            completed_retention_secs: 5,
            large_folder_threshold: 50,
        }
    }
}

impl TransferConfig {
    pub fn completed_retention(&self) -> Duration {
        Duration::from_secs(self.completed_retention_secs)
    }
}

impl Config {
    /// Parse a TOML document and validate it
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the core cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.browser.page_size == 0 {
            return Err(Error::Config("browser.page_size must be at least 1".into()));
        }
        if self.browser.delimiter.is_empty() {
            return Err(Error::Config("browser.delimiter must not be empty".into()));
        }
        if self.cache.ttl_secs == 0 {
            return Err(Error::Config("cache.ttl_secs must be at least 1".into()));
        }
        if self.cache.sweep_interval_secs == 0 {
            return Err(Error::Config(
                "cache.sweep_interval_secs must be at least 1".into(),
            ));
        }
        if self.prefetch.concurrency == 0 {
            return Err(Error::Config("prefetch.concurrency must be at least 1".into()));
        }
        if self.transfers.max_concurrent == 0 {
            return Err(Error::Config(
                "transfers.max_concurrent must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Locates and reads the configuration file
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Use `$SM_CONFIG_DIR/config.toml`, falling back to the platform
    /// config directory
    pub fn new() -> Result<Self> {
        let dir = match std::env::var_os(CONFIG_DIR_ENV) {
            Some(dir) => PathBuf::from(dir),
            None => dirs::config_dir()
                .ok_or_else(|| Error::Config("Cannot determine config directory".into()))?
                .join("sm"),
        };
        Ok(Self::with_path(dir.join(CONFIG_FILE_NAME)))
    }

    /// Use an explicit file path
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: path.into(),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Load the configuration; a missing file yields defaults
    pub fn load(&self) -> Result<Config> {
        if !self.config_path.exists() {
            tracing::debug!(path = %self.config_path.display(), "No config file, using defaults");
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(&self.config_path)?;
        Config::from_toml_str(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.browser.page_size, 200);
        assert_eq!(config.browser.delimiter, "/");
        assert_eq!(config.cache.ttl(), Duration::from_secs(600));
        assert_eq!(config.cache.sweep_interval(), Duration::from_secs(60));
        assert_eq!(config.prefetch.max_children, 8);
        assert_eq!(config.prefetch.concurrency, 3);
        assert_eq!(config.transfers.max_concurrent, 3);
        assert_eq!(config.transfers.completed_retention(), Duration::from_secs(5));
        assert_eq!(config.transfers.large_folder_threshold, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            [transfers]
            max_concurrent = 6

            [browser]
            page_size = 100
            "#,
        )
        .unwrap();

        assert_eq!(config.transfers.max_concurrent, 6);
        assert_eq!(config.transfers.completed_retention_secs, 5);
        assert_eq!(config.browser.page_size, 100);
        assert_eq!(config.browser.delimiter, "/");
        assert_eq!(config.cache, CacheConfig::default());
    }

    #[test]
    fn test_zero_values_rejected() {
        let err = Config::from_toml_str("[browser]\npage_size = 0\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = Config::from_toml_str("[transfers]\nmax_concurrent = 0\n").unwrap_err();
        assert!(err.to_string().contains("max_concurrent"));

        let err = Config::from_toml_str("[browser]\ndelimiter = \"\"\n").unwrap_err();
        assert!(err.to_string().contains("delimiter"));
    }

    #[test]
    fn test_malformed_toml() {
        let err = Config::from_toml_str("[cache\nttl_secs = ").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::with_path(dir.path().join("config.toml"));
        assert_eq!(manager.load().unwrap(), Config::default());
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[cache]\nttl_secs = 30\n").unwrap();

        let config = ConfigManager::with_path(&path).load().unwrap();
        assert_eq!(config.cache.ttl_secs, 30);
        assert_eq!(config.cache.sweep_interval_secs, 60);
    }
}
