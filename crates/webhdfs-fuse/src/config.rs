//! Mount configuration, loaded from a `.toml` or `.json` file.

use crate::cache::CacheConfig;
use crate::dispatcher::IoConfig;
use crate::idmap::IdMapConfig;
use crate::mount::MountOptions;
use crate::retry::RetryPolicy;
use crate::transport::TransportConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported config file extension: {0}")]
    UnsupportedExtension(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Switches for behaviour the remote store cannot honour faithfully.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Expose remote symlinks as symlinks and answer readlink.
    pub symlinks: bool,
    /// Report ctime equal to mtime instead of the epoch.
    pub ctime: bool,
    /// Answer xattr queries with "no attributes" instead of EOPNOTSUPP.
    pub xattr: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for TransportSettings {
    fn default() -> Self {
        let defaults = TransportConfig::default();
        TransportSettings {
            connect_timeout_ms: defaults.connect_timeout_ms,
            request_timeout_ms: defaults.request_timeout_ms,
            retry: defaults.retry,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    pub namenode_host: String,
    pub namenode_port: u16,
    /// WebHDFS `user.name`. Unset means the server's default identity.
    pub user: Option<String>,
    pub use_https: bool,
    pub cache: CacheConfig,
    pub io: IoConfig,
    pub transport: TransportSettings,
    pub features: FeatureConfig,
    pub mount: MountOptions,
    pub idmap: IdMapConfig,
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            namenode_host: String::from("localhost"),
            namenode_port: 50070,
            user: None,
            use_https: false,
            cache: CacheConfig::default(),
            io: IoConfig::default(),
            transport: TransportSettings::default(),
            features: FeatureConfig::default(),
            mount: MountOptions::default(),
            idmap: IdMapConfig::default(),
        }
    }
}

impl MountConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: MountConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => return Err(ConfigError::UnsupportedExtension(ext.to_string())),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namenode_host.trim().is_empty() {
            return Err(ConfigError::Invalid("namenode_host is empty".into()));
        }
        if self.namenode_port == 0 {
            return Err(ConfigError::Invalid("namenode_port must be non-zero".into()));
        }
        if self.cache.capacity == 0 {
            return Err(ConfigError::Invalid("cache.capacity must be non-zero".into()));
        }
        if self.io.flush_threshold == 0 {
            return Err(ConfigError::Invalid("io.flush_threshold must be non-zero".into()));
        }
        if self.transport.retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "transport.retry.backoff_multiplier must be at least 1.0".into(),
            ));
        }
        Ok(())
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            namenode_host: self.namenode_host.clone(),
            namenode_port: self.namenode_port,
            use_https: self.use_https,
            user: self.user.clone(),
            connect_timeout_ms: self.transport.connect_timeout_ms,
            request_timeout_ms: self.transport.request_timeout_ms,
            retry: self.transport.retry.clone(),
        }
    }

    /// Identity reported as owner of files that exist only locally.
    pub fn effective_user(&self) -> String {
        self.user.clone().unwrap_or_else(|| String::from("nobody"))
    }
}
