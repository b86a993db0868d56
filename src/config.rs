//! Persisted CLI defaults
//!
//! Stores the default relay URL and auth token in ~/.iap/config.json

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IapConfig {
    /// Default relay base URL
    #[serde(default)]
    pub relay_url: Option<String>,

    /// Default bearer token
    #[serde(default)]
    pub auth_token: Option<String>,
}

/// Reads and writes the config file
pub struct ConfigManager {
    path: PathBuf,
}

impl ConfigManager {
    /// Manager for ~/.iap/config.json
    pub fn new() -> Result<Self> {
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Ok(Self::with_path(home.join(".iap").join("config.json")))
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the configuration, or the default if no file exists yet
    pub fn load(&self) -> Result<IapConfig> {
        if !self.path.exists() {
            return Ok(IapConfig::default());
        }

        let json = fs::read_to_string(&self.path)
            .context(format!("Failed to read config file: {:?}", self.path))?;

        serde_json::from_str(&json).context(format!("Failed to parse config file: {:?}", self.path))
    }

    pub fn save(&self, config: &IapConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create config directory: {:?}", parent))?;
        }

        let json = serde_json::to_string_pretty(config).context("Failed to serialize config")?;
        fs::write(&self.path, json)
            .context(format!("Failed to write config file: {:?}", self.path))
    }

    pub fn set_relay(&self, relay_url: String) -> Result<()> {
        let mut config = self.load()?;
        config.relay_url = Some(relay_url);
        self.save(&config)
    }

    pub fn set_token(&self, token: String) -> Result<()> {
        let mut config = self.load()?;
        config.auth_token = Some(token);
        self.save(&config)
    }

    pub fn clear_token(&self) -> Result<()> {
        let mut config = self.load()?;
        config.auth_token = None;
        self.save(&config)
    }
}
