//! Taplog configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, TaplogError};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaplogConfig {
    #[serde(default)]
    pub batch: BatchPolicy,
    #[serde(default)]
    pub init: InitConfig,
    #[serde(default)]
    pub sink: SinkConfig,
}

impl TaplogConfig {
    /// Load config from the default path (~/.taplog/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TaplogError::config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| TaplogError::config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    /// Save config to a specific path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| TaplogError::config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check every section for values the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.batch.validate()?;
        if self.sink.kind == SinkKind::Webhook && self.sink.webhook_url.is_none() {
            return Err(TaplogError::config("sink.kind = \"webhook\" requires sink.webhook_url"));
        }
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Taplog home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".taplog")
    }
}

/// Size/time policy of one batch scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchPolicy {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Pending count that triggers an immediate flush. Ignored when disabled.
    #[serde(default = "default_threshold_size")]
    pub threshold_size: usize,
    /// Longest wait between flushes when the threshold is not reached.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

fn bool_true() -> bool { true }
fn default_threshold_size() -> usize { 5 }
fn default_interval_ms() -> u64 { 500 }

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_size: default_threshold_size(),
            interval_ms: default_interval_ms(),
        }
    }
}

impl BatchPolicy {
    pub fn new(threshold_size: usize, interval: Duration) -> Self {
        Self {
            enabled: true,
            threshold_size,
            interval_ms: interval.as_millis() as u64,
        }
    }

    /// Batch-of-one policy: every append flushes on its own.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.threshold_size == 0 {
            return Err(TaplogError::config("batch.threshold_size must be positive"));
        }
        if self.interval_ms == 0 {
            return Err(TaplogError::config("batch.interval_ms must be positive"));
        }
        Ok(())
    }
}

/// What happens to gated events when the init action fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitFailurePolicy {
    /// Log the failure and open the gate anyway.
    #[default]
    Proceed,
    /// Reject every gated and later report with `InitFailed`.
    Reject,
}

/// Init gate configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitConfig {
    #[serde(default)]
    pub on_failure: InitFailurePolicy,
    /// Treat an init action still running after this long as failed.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl InitConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    #[default]
    Stdout,
    Webhook,
}

/// Where the CLI delivers flushed batches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SinkConfig {
    #[serde(default)]
    pub kind: SinkKind,
    #[serde(default)]
    pub webhook_url: Option<String>,
}
