//! Broker configuration.
//!
//! Loaded once at startup and shared read-only across brokers.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

use crate::error::Result;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BrokerConfig {
    /// Root of the per-document tile cache tree.
    pub cache_root: PathBuf,
    /// Root under which per-child jails are created.
    pub child_root: PathBuf,
    #[serde(default = "default_true")]
    pub autosave_enabled: bool,
    /// Period of the forced autosave check, in seconds.
    #[serde(default = "default_autosave_period_secs")]
    pub autosave_period_secs: u64,
    /// Idle documents are torn down after this many seconds.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Inactivity threshold for the unforced (modified-only) save path.
    #[serde(default = "default_idle_save_ms")]
    pub idle_save_duration_ms: u64,
    /// Elapsed-since-save threshold for the unforced save path.
    #[serde(default = "default_auto_save_ms")]
    pub auto_save_duration_ms: u64,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Keep rendered tiles on disk across broker lifetimes.
    #[serde(default = "default_true")]
    pub tile_cache_persistent: bool,
    /// SQLite database backing the one-shot access-token ledger.
    #[serde(default)]
    pub token_db_path: Option<PathBuf>,
    /// Permission policy file; falls back to `perm.xml` in the working
    /// directory when unset.
    #[serde(default)]
    pub perm_file: Option<PathBuf>,
    /// Whether clients are served over TLS (forces the postMessage origin
    /// scheme to https).
    #[serde(default)]
    pub ssl_enabled: bool,
}

fn default_true() -> bool {
    true
}

fn default_autosave_period_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    3600
}

fn default_idle_save_ms() -> u64 {
    30_000
}

fn default_auto_save_ms() -> u64 {
    300_000
}

fn default_command_timeout_ms() -> u64 {
    5_000
}

fn default_poll_timeout_ms() -> u64 {
    5_000
}

impl BrokerConfig {
    /// A configuration rooted at the given directories, everything else
    /// at defaults.
    pub fn with_roots(cache_root: impl Into<PathBuf>, child_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            child_root: child_root.into(),
            autosave_enabled: default_true(),
            autosave_period_secs: default_autosave_period_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            idle_save_duration_ms: default_idle_save_ms(),
            auto_save_duration_ms: default_auto_save_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            poll_timeout_ms: default_poll_timeout_ms(),
            tile_cache_persistent: default_true(),
            token_db_path: None,
            perm_file: None,
            ssl_enabled: false,
        }
    }

    pub async fn load(path: &std::path::Path) -> Result<Self> {
        let content = fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&content)?)
    }

    pub async fn save(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).await?;
        Ok(())
    }
}
