use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Application configuration, read from TOML.
///
/// Connection strings are never stored here; they live in memory only.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub settings: ExplorerSettings,
}

/// Tunables of the message-lifecycle operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplorerSettings {
    /// Batch size for peeks that do not name one.
    pub peek_count: usize,
    pub probe_timeout_ms: u64,
    /// Grace period between opening a receiver and its first peek.
    pub settle_delay_ms: u64,
    pub locate_max_attempts: u32,
    pub locate_batch_size: usize,
    pub locate_wait_ms: u64,
    /// Deadline on list/peek/send calls. 0 disables it.
    pub operation_timeout_ms: u64,
    pub log_to_file: bool,
}

impl Default for ExplorerSettings {
    fn default() -> Self {
        Self {
            peek_count: 10,
            probe_timeout_ms: 3000,
            settle_delay_ms: 100,
            locate_max_attempts: 5,
            locate_batch_size: 5,
            locate_wait_ms: 2000,
            operation_timeout_ms: 30_000,
            log_to_file: false,
        }
    }
}

impl ExplorerSettings {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn locate_wait(&self) -> Duration {
        Duration::from_millis(self.locate_wait_ms)
    }

    pub fn operation_timeout(&self) -> Option<Duration> {
        (self.operation_timeout_ms > 0).then(|| Duration::from_millis(self.operation_timeout_ms))
    }
}

impl AppConfig {
    /// Standard config directory: ~/.config/sb-explorer
    pub fn config_dir() -> PathBuf {
        dirs_fallback().join("sb-explorer")
    }

    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Load config from disk. Returns defaults if the file doesn't exist.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

/// Cross-platform config directory fallback.
fn dirs_fallback() -> PathBuf {
    // Try XDG_CONFIG_HOME, then platform defaults
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg);
    }

    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support");
        }
    }

    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata);
        }
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".config");
        }
    }

    PathBuf::from(".")
}
