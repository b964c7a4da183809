//! Application configuration management.
//!
//! This module handles loading and saving the session configuration:
//! the API base URL, renewal timing, token lifetime and which token stores
//! to use.
//!
//! Configuration is stored at `~/.config/pawsession/config.json`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Application name used for config/data directory paths
pub const APP_NAME: &str = "pawsession";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Environment variable that overrides `api_url`
pub const API_URL_ENV: &str = "API_URL";

const DEFAULT_API_URL: &str = "http://localhost:5000/api";

/// Renew this many seconds before the access token expires.
const DEFAULT_RENEW_BEFORE_SECS: i64 = 5 * 60;

/// Token keys live this long in the cookie store.
const DEFAULT_TOKEN_TTL_DAYS: i64 = 30;

/// HTTP request timeout in seconds.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_url: String,
    pub renew_before_secs: i64,
    pub token_ttl_days: i64,
    pub request_timeout_secs: u64,
    /// Also keep tokens in the OS keychain
    pub use_keyring: bool,
    /// Where token files live; defaults to the platform data dir
    pub data_dir: Option<PathBuf>,
    pub last_email: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            renew_before_secs: DEFAULT_RENEW_BEFORE_SECS,
            token_ttl_days: DEFAULT_TOKEN_TTL_DAYS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            use_keyring: false,
            data_dir: None,
            last_email: None,
        }
    }
}

impl Config {
    /// Load config from disk and apply environment overrides
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = Self::load_from(&path)?;
        config.apply_env();
        Ok(config)
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")
        } else {
            Ok(Self::default())
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

    /// `API_URL` wins over the file value
    pub fn apply_env(&mut self) {
        self.apply_api_url(std::env::var(API_URL_ENV).ok());
    }

    fn apply_api_url(&mut self, value: Option<String>) {
        if let Some(url) = value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
            self.api_url = url;
        }
    }

    /// API base URL without a trailing slash
    pub fn api_base(&self) -> &str {
        self.api_url.trim_end_matches('/')
    }

    pub fn renew_before(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.renew_before_secs.max(0))
    }

    pub fn token_ttl(&self) -> chrono::Duration {
        chrono::Duration::days(self.token_ttl_days.max(1))
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.data_dir {
            return Ok(dir.clone());
        }
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.renew_before(), chrono::Duration::minutes(5));
        assert_eq!(config.token_ttl(), chrono::Duration::days(30));
        assert!(!config.use_keyring);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"api_url":"https://api.pawclinic.in/"}"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.api_base(), "https://api.pawclinic.in");
        assert_eq!(config.request_timeout_secs, 30);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("nope.json")).unwrap();
        assert_eq!(config.api_url, DEFAULT_API_URL);
    }

    #[test]
    fn test_api_url_override() {
        let mut config = Config::default();
        config.apply_api_url(Some("https://staging.pawclinic.in/api".to_string()));
        assert_eq!(config.api_url, "https://staging.pawclinic.in/api");

        // Blank values don't clobber the configured URL
        config.apply_api_url(Some("   ".to_string()));
        assert_eq!(config.api_url, "https://staging.pawclinic.in/api");
        config.apply_api_url(None);
        assert_eq!(config.api_url, "https://staging.pawclinic.in/api");
    }
}
