//! CLI configuration
//!
//! Loaded from a YAML file (`~/.config/davdrive/config.yaml` by default).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use davdrive_core::config::SyncOptions;

/// Top-level configuration for the davdrive CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub account: AccountConfig,
    pub folder: FolderConfig,
    #[serde(default)]
    pub sync: SyncOptions,
}

/// Server account settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Base URL of the server, e.g. `https://cloud.example.com`.
    pub server_url: String,
    pub username: String,
    /// App password or token for the account.
    pub password: String,
}

/// Local folder settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderConfig {
    /// Root of the synchronized directory tree.
    pub local_path: PathBuf,
    /// Journal database location; defaults to `.davdrive.db` inside the
    /// local folder.
    pub journal_path: Option<PathBuf>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }

    /// Loads from an explicit path or the default location.
    pub fn load_from(path: Option<&str>) -> Result<Self> {
        let path = match path {
            Some(p) => PathBuf::from(p),
            None => default_config_path(),
        };
        Self::load(&path)
    }

    /// Resolved journal database path.
    pub fn journal_path(&self) -> PathBuf {
        self.folder
            .journal_path
            .clone()
            .unwrap_or_else(|| self.folder.local_path.join(".davdrive.db"))
    }
}

fn default_config_path() -> PathBuf {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("davdrive/config.yaml")
}
