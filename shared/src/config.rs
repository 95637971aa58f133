use secrecy::SecretString;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::capabilities::http::{HttpError, ValidatedUrl, DEFAULT_TIMEOUT_MS, MAX_TIMEOUT_MS};
use crate::image_processing::ProcessingConfig;
use crate::local_store::{BackupRetention, DEFAULT_IMAGE_BACKUPS_KEPT};
use crate::{AppError, ErrorKind};

pub const API_KEY_ENV: &str = "LISTINGS_API_KEY";
const DEFAULT_HISTORY_LIMIT: usize = 100;
const DEFAULT_DETAIL_CACHE_SIZE: usize = 64;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid {section} config: {reason}")]
    Invalid {
        section: &'static str,
        reason: String,
    },

    #[error("remote API key not found, set {0}")]
    MissingApiKey(&'static str),

    #[error("invalid remote URL: {0}")]
    Url(#[from] HttpError),
}

impl From<ConfigError> for AppError {
    fn from(e: ConfigError) -> Self {
        AppError::new(ErrorKind::Validation, e.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub images: ProcessingConfig,
    pub store: StoreConfig,
    /// Absent means the local store is the only tier.
    pub remote: Option<RemoteConfig>,
    /// Mutations remembered in the history ring.
    pub history_limit: usize,
    pub detail_cache_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            images: ProcessingConfig::default(),
            store: StoreConfig::default(),
            remote: None,
            history_limit: DEFAULT_HISTORY_LIMIT,
            detail_cache_size: DEFAULT_DETAIL_CACHE_SIZE,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Image-set backups kept per listing; `null` keeps all of them.
    pub image_backups_kept: Option<usize>,
    /// SQLite file backing the key-value store; in-memory when unset.
    pub sqlite_path: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            image_backups_kept: Some(DEFAULT_IMAGE_BACKUPS_KEPT),
            sqlite_path: None,
        }
    }
}

impl StoreConfig {
    #[must_use]
    pub fn retention(&self) -> BackupRetention {
        self.image_backups_kept
            .map_or(BackupRetention::Unbounded, BackupRetention::KeepLatest)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    pub base_url: String,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Admit loopback and private hosts, for local development backends.
    #[serde(default)]
    pub allow_private_network: bool,
}

fn default_table() -> String {
    "listings".to_string()
}

fn default_bucket() -> String {
    "listing-images".to_string()
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

impl RemoteConfig {
    pub fn validated_url(&self) -> Result<ValidatedUrl, ConfigError> {
        Ok(ValidatedUrl::with_policy(
            self.base_url.as_str(),
            self.allow_private_network,
        )?)
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Reads the API key from the environment. Never taken from the file.
    pub fn api_key() -> Result<SecretString, ConfigError> {
        Self::api_key_from(|name| std::env::var(name).ok())
    }

    pub fn api_key_from(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<SecretString, ConfigError> {
        lookup(API_KEY_ENV)
            .filter(|key| !key.trim().is_empty())
            .map(SecretString::new)
            .ok_or(ConfigError::MissingApiKey(API_KEY_ENV))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.validated_url()?;
        let invalid = |reason: String| ConfigError::Invalid {
            section: "remote",
            reason,
        };
        if self.table.trim().is_empty() || self.bucket.trim().is_empty() {
            return Err(invalid("table and bucket must not be empty".into()));
        }
        if self.timeout_ms == 0 || self.timeout_ms > MAX_TIMEOUT_MS {
            return Err(invalid(format!(
                "timeout_ms must be in 1..={MAX_TIMEOUT_MS}, got {}",
                self.timeout_ms
            )));
        }
        Ok(())
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_yaml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.images.validate().map_err(|reason| ConfigError::Invalid {
            section: "images",
            reason,
        })?;
        if self.store.image_backups_kept == Some(0) {
            return Err(ConfigError::Invalid {
                section: "store",
                reason: "image_backups_kept must be > 0 or null".into(),
            });
        }
        if self.history_limit == 0 || self.detail_cache_size == 0 {
            return Err(ConfigError::Invalid {
                section: "pipeline",
                reason: "history_limit and detail_cache_size must be > 0".into(),
            });
        }
        if let Some(remote) = &self.remote {
            remote.validate()?;
        }
        Ok(())
    }
}
