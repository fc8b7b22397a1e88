//! Application configuration management.
//!
//! The API base URL is resolved from, in order: the `NUTRICOACH_API_URL`
//! environment variable, `api_base_url` in the config file, and (development
//! builds only) a local fallback.
//!
//! The config file is stored at `~/.config/nutricoach/config.json`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::api::client::{REQUEST_TIMEOUT_SECS, UPLOAD_TIMEOUT_SECS};

/// Application name used for config/data/cache directory paths
const APP_NAME: &str = "nutricoach";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Environment variable carrying the API base URL
pub const API_URL_ENV: &str = "NUTRICOACH_API_URL";

/// Local backend used when nothing is configured in a development build
const DEV_FALLBACK_URL: &str = "http://localhost:3000/api/v1";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("No API base URL configured. Set NUTRICOACH_API_URL or api_base_url in the config file.")]
    MissingBaseUrl,

    #[error("Invalid API base URL '{0}': must start with http:// or https://")]
    InvalidBaseUrl(String),
}

/// Which kind of build is running. Decides whether a missing base URL is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildProfile {
    Development,
    Production,
}

impl BuildProfile {
    pub fn current() -> Self {
        if cfg!(debug_assertions) {
            BuildProfile::Development
        } else {
            BuildProfile::Production
        }
    }
}

/// On-disk overrides. Every field is optional.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ConfigFile {
    pub api_base_url: Option<String>,
    pub request_timeout_secs: Option<u64>,
    pub upload_timeout_secs: Option<u64>,
    pub last_phone: Option<String>,
}

impl ConfigFile {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
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
}

/// Resolved runtime configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub api_base_url: String,
    pub request_timeout: Duration,
    pub upload_timeout: Duration,
    /// Where the sealed client snapshot lives
    pub data_dir: PathBuf,
    /// Where log files go
    pub cache_dir: PathBuf,
}

impl Config {
    /// Resolve configuration from the environment, the config file and the
    /// platform directories.
    pub fn load() -> Result<Self> {
        let file = ConfigFile::load()?;
        let env_url = std::env::var(API_URL_ENV).ok();
        let data_dir = dirs::data_local_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?
            .join(APP_NAME);
        let cache_dir = Self::default_cache_dir()?;
        Ok(Self::resolve(
            env_url.as_deref(),
            &file,
            BuildProfile::current(),
            data_dir,
            cache_dir,
        )?)
    }

    pub fn default_cache_dir() -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn resolve(
        env_url: Option<&str>,
        file: &ConfigFile,
        profile: BuildProfile,
        data_dir: PathBuf,
        cache_dir: PathBuf,
    ) -> Result<Self, ConfigError> {
        let configured = env_url
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .or_else(|| {
                file.api_base_url
                    .as_deref()
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
            });

        let api_base_url = match (configured, profile) {
            (Some(url), _) => url.to_string(),
            (None, BuildProfile::Development) => {
                warn!(url = DEV_FALLBACK_URL, "No API base URL configured, using development fallback");
                DEV_FALLBACK_URL.to_string()
            }
            (None, BuildProfile::Production) => return Err(ConfigError::MissingBaseUrl),
        };

        if !(api_base_url.starts_with("http://") || api_base_url.starts_with("https://")) {
            return Err(ConfigError::InvalidBaseUrl(api_base_url));
        }

        Ok(Self {
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            request_timeout: Duration::from_secs(
                file.request_timeout_secs.unwrap_or(REQUEST_TIMEOUT_SECS),
            ),
            upload_timeout: Duration::from_secs(
                file.upload_timeout_secs.unwrap_or(UPLOAD_TIMEOUT_SECS),
            ),
            data_dir,
            cache_dir,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(
        env_url: Option<&str>,
        file: &ConfigFile,
        profile: BuildProfile,
    ) -> Result<Config, ConfigError> {
        Config::resolve(env_url, file, profile, PathBuf::from("/data"), PathBuf::from("/cache"))
    }

    fn file_with(url: &str) -> ConfigFile {
        ConfigFile {
            api_base_url: Some(url.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_env_beats_file() {
        let config = resolve(
            Some("https://env.example/api/v1/"),
            &file_with("https://file.example/api/v1"),
            BuildProfile::Production,
        )
        .unwrap();
        assert_eq!(config.api_base_url, "https://env.example/api/v1");
    }

    #[test]
    fn test_file_used_when_env_blank() {
        let config = resolve(
            Some("  "),
            &file_with("https://file.example/api/v1"),
            BuildProfile::Production,
        )
        .unwrap();
        assert_eq!(config.api_base_url, "https://file.example/api/v1");
        assert_eq!(config.request_timeout, Duration::from_secs(15));
        assert_eq!(config.upload_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_missing_url_by_profile() {
        let empty = ConfigFile::default();
        assert_eq!(
            resolve(None, &empty, BuildProfile::Production),
            Err(ConfigError::MissingBaseUrl)
        );
        let config = resolve(None, &empty, BuildProfile::Development).unwrap();
        assert_eq!(config.api_base_url, DEV_FALLBACK_URL);
    }

    #[test]
    fn test_rejects_non_http_url() {
        assert_eq!(
            resolve(Some("ftp://files.example"), &ConfigFile::default(), BuildProfile::Development),
            Err(ConfigError::InvalidBaseUrl("ftp://files.example".to_string()))
        );
    }

    #[test]
    fn test_timeout_overrides() {
        let file = ConfigFile {
            api_base_url: Some("http://10.0.2.2:3000/api/v1".into()),
            request_timeout_secs: Some(5),
            upload_timeout_secs: Some(120),
            last_phone: None,
        };
        let config = resolve(None, &file, BuildProfile::Production).unwrap();
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.upload_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_config_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);
        assert_eq!(ConfigFile::load_from(&path).unwrap(), ConfigFile::default());

        let file = ConfigFile {
            last_phone: Some("+15550100".into()),
            ..file_with("https://api.example/v1")
        };
        file.save_to(&path).unwrap();
        assert_eq!(ConfigFile::load_from(&path).unwrap(), file);
    }
}
