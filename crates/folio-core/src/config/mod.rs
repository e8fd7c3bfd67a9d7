//! Configuration management with file persistence
//!
//! The configuration object is constructed once at startup and passed
//! explicitly to the components that need it. There is no process-global
//! settings map.

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

/// Folio configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    pub plugins: PluginsConfig,
    pub sandbox: SandboxConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database file. Empty means the default location.
    pub database_path: Option<PathBuf>,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginsConfig {
    /// Directory installed plugin packages are unpacked into
    pub install_dir: Option<PathBuf>,
    /// Directory retaining archived package versions for rollback
    pub cache_dir: Option<PathBuf>,
    /// Ceiling on the cumulative unpacked size of a package, in bytes
    pub max_package_bytes: u64,
    /// Trusted package signer public key (base64-encoded ed25519).
    /// When unset, signature verification is disabled.
    #[serde(skip)]
    pub signer_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Per-call wall clock budget
    pub call_timeout_secs: u64,
    /// Grace period for a sandbox worker to stop on disable
    pub shutdown_grace_secs: u64,
    /// Wasm fuel budget per call
    pub fuel_limit: u64,
    /// Wasm linear memory ceiling in bytes
    pub memory_limit_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig {
                database_path: None,
                max_connections: 5,
            },
            plugins: PluginsConfig {
                install_dir: None,
                cache_dir: None,
                max_package_bytes: 32 * 1024 * 1024,
                signer_key: None,
            },
            sandbox: SandboxConfig {
                call_timeout_secs: 5,
                shutdown_grace_secs: 3,
                fuel_limit: 10_000_000,
                memory_limit_bytes: 16 * 1024 * 1024,
            },
        }
    }
}

impl PluginsConfig {
    /// Resolve the trusted signer key, preferring the environment.
    ///
    /// Signer keys are never written to the config file; they arrive via
    /// `FOLIO_PLUGIN_SIGNER_KEY` or are set programmatically by the host.
    pub fn resolved_signer_key(&self) -> Option<String> {
        env::var("FOLIO_PLUGIN_SIGNER_KEY")
            .ok()
            .or_else(|| self.signer_key.clone())
    }

    /// Directory installed plugins live in
    pub fn resolved_install_dir(&self) -> anyhow::Result<PathBuf> {
        if let Some(dir) = &self.install_dir {
            return Ok(dir.clone());
        }
        Ok(Config::data_dir()?.join("plugins"))
    }

    /// Directory retained package archives live in
    pub fn resolved_cache_dir(&self) -> anyhow::Result<PathBuf> {
        if let Some(dir) = &self.cache_dir {
            return Ok(dir.clone());
        }
        Ok(Config::data_dir()?.join("plugin-cache"))
    }
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("FOLIO_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("folio")
        };
        Ok(dir)
    }

    /// Get the data directory path
    pub fn data_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("FOLIO_DATA_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::data_dir()
                .ok_or_else(|| anyhow!("Could not determine data directory"))?
                .join("folio")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from file, or create default if it doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;

        if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> anyhow::Result<()> {
        let path = Self::config_path()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = Config::default();
        assert_eq!(config.sandbox.call_timeout_secs, 5);
        assert!(config.plugins.max_package_bytes > 0);
        assert!(config.plugins.signer_key.is_none());
    }

    #[test]
    fn config_round_trips_through_toml() {
        let config = Config::default();
        let serialized = toml::to_string_pretty(&config).expect("serialize");
        let parsed: Config = toml::from_str(&serialized).expect("parse");
        assert_eq!(parsed.storage.max_connections, config.storage.max_connections);
        assert_eq!(parsed.plugins.max_package_bytes, config.plugins.max_package_bytes);
        assert_eq!(parsed.sandbox.fuel_limit, config.sandbox.fuel_limit);
    }

    #[test]
    fn signer_key_is_never_serialized() {
        let mut config = Config::default();
        config.plugins.signer_key = Some("c2VjcmV0".to_string());
        let serialized = toml::to_string_pretty(&config).expect("serialize");
        assert!(!serialized.contains("c2VjcmV0"));
    }
}
