//! Application configuration management.
//!
//! This module handles loading and saving the client configuration: the
//! service base URL, the password encryption policy, where the session is
//! persisted, and the last used email.
//!
//! Configuration is stored at `~/.config/finmgr/config.json`. The
//! `FM_API_BASE` environment variable overrides `api_base`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auth::KeyPolicy;

/// Application name used for config/data directory paths
const APP_NAME: &str = "finmgr";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Environment variable overriding the service base URL
pub const API_BASE_ENV: &str = "FM_API_BASE";

const DEFAULT_API_BASE: &str = "http://127.0.0.1:8000";

/// Where the session token and email are persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    File,
    Keyring,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base: String,
    /// Encrypt passwords with the server public key when one is available
    pub encrypt_passwords: bool,
    pub key_policy: KeyPolicy,
    /// Age after which a cached public key is fetched again
    pub pubkey_max_age_secs: u64,
    pub request_timeout_secs: u64,
    pub storage: StorageBackend,
    pub last_email: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            encrypt_passwords: true,
            key_policy: KeyPolicy::Refresh,
            pubkey_max_age_secs: 600,
            request_timeout_secs: 30,
            storage: StorageBackend::File,
            last_email: None,
        }
    }
}

impl Config {
    /// Load from the default location and apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_env();
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))
        } else {
            debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Record the last used email. Rewrites the file as stored on disk so
    /// environment and command-line overrides are not persisted.
    pub fn remember_email(email: &str) -> Result<()> {
        let path = Self::config_path()?;
        let mut stored = Self::load_from(&path)?;
        stored.last_email = Some(email.to_string());
        stored.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(base) = std::env::var(API_BASE_ENV) {
            if !base.trim().is_empty() {
                self.api_base = base;
            }
        }
    }

    /// Base URL without a trailing slash
    pub fn base_url(&self) -> &str {
        self.api_base.trim_end_matches('/')
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory holding the persisted session file
    pub fn data_dir(&self) -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }
}
