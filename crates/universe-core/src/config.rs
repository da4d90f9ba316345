//! Client configuration.
//!
//! Endpoints, the shared envelope key, an optional proxy and the request
//! timeout. Settings are read from `~/.config/universe/config.json` and then
//! overridden by `UNIVERSE_*` environment variables. Bearer tokens are never
//! stored here.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::api::backend::REQUEST_TIMEOUT_SECS;
use crate::api::SymmetricKey;
use crate::auth::session::DEFAULT_REFRESH_URL;
use crate::auth::SessionSettings;

/// Application name used for the config directory path
const APP_NAME: &str = "universe";

/// Config file name
const CONFIG_FILE: &str = "config.json";

pub const DEFAULT_API_BASE_URL: &str = "https://api.universe-official.io";

pub const ENV_API_BASE: &str = "UNIVERSE_API_BASE";
pub const ENV_REFRESH_URL: &str = "UNIVERSE_REFRESH_URL";
pub const ENV_JWE_KEY: &str = "UNIVERSE_JWE_KEY";
pub const ENV_PROXY: &str = "UNIVERSE_PROXY";
pub const ENV_TIMEOUT_SECS: &str = "UNIVERSE_TIMEOUT_SECS";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub refresh_url: String,
    /// Raw key bytes, written as a list of integers in the file.
    pub jwe_key: Vec<u8>,
    pub proxy: Option<String>,
    pub timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            refresh_url: DEFAULT_REFRESH_URL.to_string(),
            jwe_key: Vec::new(),
            proxy: None,
            timeout_secs: REQUEST_TIMEOUT_SECS,
        }
    }
}

impl Config {
    /// Load the config file (if any) and apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            debug!(path = %path.display(), "Loading config");
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Invalid config file {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    /// Apply `UNIVERSE_*` overrides. `lookup` returns the value of a variable
    /// if it is set; empty values count as unset.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(url) = get(ENV_API_BASE) {
            self.api_base_url = url;
        }
        if let Some(url) = get(ENV_REFRESH_URL) {
            self.refresh_url = url;
        }
        if let Some(encoded) = get(ENV_JWE_KEY) {
            self.jwe_key = STANDARD
                .decode(encoded.trim())
                .with_context(|| format!("{} is not valid base64", ENV_JWE_KEY))?;
        }
        if let Some(proxy) = get(ENV_PROXY) {
            self.proxy = Some(proxy);
        }
        if let Some(secs) = get(ENV_TIMEOUT_SECS) {
            self.timeout_secs = secs.trim().parse().with_context(|| {
                format!("{} must be a whole number of seconds", ENV_TIMEOUT_SECS)
            })?;
        }
        Ok(())
    }

    pub fn symmetric_key(&self) -> Result<SymmetricKey> {
        if self.jwe_key.is_empty() {
            anyhow::bail!("No envelope key configured; set {}", ENV_JWE_KEY);
        }
        Ok(SymmetricKey::from_slice(&self.jwe_key)?)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Absolute URL for `path` under the API base.
    pub fn endpoint(&self, path: &str) -> String {
        if path.starts_with("https://") || path.starts_with("http://") {
            return path.to_string();
        }
        format!(
            "{}/{}",
            self.api_base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub fn session_settings(&self) -> Result<SessionSettings> {
        let mut settings =
            SessionSettings::new(self.symmetric_key()?).with_refresh_url(&self.refresh_url);
        if let Some(ref proxy) = self.proxy {
            settings = settings.with_proxy(proxy);
        }
        Ok(settings)
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }
}
