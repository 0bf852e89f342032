//! Application configuration management.
//!
//! The configuration file lives at `~/.config/porter-auth/config.json` (or the
//! platform equivalent). Environment variables override it:
//! - `PORTER_API_URL`: backend base origin
//! - `PORTER_STORAGE`: `file`, `keyring` or `memory`
//! - `PORTER_STORE_PASSPHRASE`: seal the session file with this passphrase

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::storage::{DurableStorage, FileStorage, KeyringStorage, MemoryStorage};

/// Application name used for config/data directory paths
const APP_NAME: &str = "porter-auth";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Base origin used when neither the environment nor the config file set one
pub const DEFAULT_API_URL: &str = "http://localhost:3000/api";

/// HTTP request timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

pub const API_URL_ENV: &str = "PORTER_API_URL";
pub const STORAGE_ENV: &str = "PORTER_STORAGE";
pub const PASSPHRASE_ENV: &str = "PORTER_STORE_PASSPHRASE";

/// Where credentials are persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    File,
    Keyring,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(StorageBackend::File),
            "keyring" => Ok(StorageBackend::Keyring),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(anyhow::anyhow!("Unknown storage backend: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub api_url: Option<String>,
    pub last_email: Option<String>,
    #[serde(default)]
    pub storage: StorageBackend,
    pub request_timeout_secs: Option<u64>,
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    /// Load the config file, falling back to defaults if it can't be read.
    pub fn load_or_default() -> Self {
        match Self::load() {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "Failed to load config, using defaults");
                Self::default()
            }
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    /// Backend base origin: environment, then config file, then the default.
    pub fn api_base_url(&self) -> String {
        let env_url = std::env::var(API_URL_ENV).ok();
        Self::resolve_api_url(env_url.as_deref(), self.api_url.as_deref())
    }

    fn resolve_api_url(env_url: Option<&str>, file_url: Option<&str>) -> String {
        let url = [env_url, file_url]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|u| !u.is_empty())
            .unwrap_or(DEFAULT_API_URL);
        url.trim_end_matches('/').to_string()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS))
    }

    /// Storage backend: `PORTER_STORAGE` if it parses, otherwise the config file.
    pub fn storage_backend(&self) -> StorageBackend {
        match std::env::var(STORAGE_ENV) {
            Ok(value) => value.parse().unwrap_or_else(|e| {
                warn!(error = %e, "Ignoring {}", STORAGE_ENV);
                self.storage
            }),
            Err(_) => self.storage,
        }
    }

    /// Build the durable storage this configuration asks for.
    pub fn open_storage(&self) -> Result<Box<dyn DurableStorage>> {
        let storage: Box<dyn DurableStorage> = match self.storage_backend() {
            StorageBackend::File => {
                let dir = self.data_dir()?;
                match std::env::var(PASSPHRASE_ENV) {
                    Ok(passphrase) if !passphrase.is_empty() => {
                        Box::new(FileStorage::with_passphrase(dir, passphrase))
                    }
                    _ => Box::new(FileStorage::new(dir)),
                }
            }
            StorageBackend::Keyring => Box::new(KeyringStorage::new()),
            StorageBackend::Memory => Box::new(MemoryStorage::new()),
        };
        Ok(storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_api_url_precedence() {
        assert_eq!(Config::resolve_api_url(None, None), DEFAULT_API_URL);
        assert_eq!(
            Config::resolve_api_url(None, Some("https://file.example/api/")),
            "https://file.example/api"
        );
        assert_eq!(
            Config::resolve_api_url(Some("https://env.example"), Some("https://file.example")),
            "https://env.example"
        );
        // Blank env values don't mask the config file
        assert_eq!(
            Config::resolve_api_url(Some("  "), Some("https://file.example")),
            "https://file.example"
        );
    }

    #[test]
    fn test_storage_backend_from_str() {
        assert_eq!("file".parse::<StorageBackend>().unwrap(), StorageBackend::File);
        assert_eq!(" Keyring ".parse::<StorageBackend>().unwrap(), StorageBackend::Keyring);
        assert_eq!("MEMORY".parse::<StorageBackend>().unwrap(), StorageBackend::Memory);
        assert!("redis".parse::<StorageBackend>().is_err());
    }

    #[test]
    fn test_config_defaults_when_fields_missing() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.storage, StorageBackend::File);
        assert_eq!(config.request_timeout(), Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS));

        let config: Config =
            serde_json::from_str(r#"{"storage":"keyring","request_timeout_secs":5}"#).unwrap();
        assert_eq!(config.storage, StorageBackend::Keyring);
        assert_eq!(config.request_timeout(), Duration::from_secs(5));
    }
}
