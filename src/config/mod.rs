//! Configuration - TOML file with CLI/env overrides
//!
//! Stored in `~/.config/helmsman/config.toml`. The API key never lives in
//! the file; it comes from the environment or the command line.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{HelmsmanError, Result};
use crate::limit::bucket::RateLimitConfig;
use crate::limit::usage::{UsageLimits, UsageWindow};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Transcript store location; defaults to `$HOME/.helmsman/chat.db`
    pub db_path: Option<PathBuf>,
    pub chat: ChatConfig,
    pub rate_limit: RateLimitSection,
    pub usage_limit: UsageLimitSection,
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub model: String,
    pub system_prompt: Option<String>,
    pub max_tokens: u32,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            model: crate::llm::anthropic::DEFAULT_MODEL.to_string(),
            system_prompt: None,
            max_tokens: 4096,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    pub rpm: u32,
    pub itpm: u64,
    pub otpm: u64,
    pub queue_when_limited: bool,
    pub max_queue_size: usize,
    pub queue_timeout_ms: u64,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        let defaults = RateLimitConfig::default();
        Self {
            rpm: defaults.rpm,
            itpm: defaults.itpm,
            otpm: defaults.otpm,
            queue_when_limited: defaults.queue_when_limited,
            max_queue_size: defaults.max_queue_size,
            queue_timeout_ms: defaults.queue_timeout_ms,
        }
    }
}

impl From<&RateLimitSection> for RateLimitConfig {
    fn from(section: &RateLimitSection) -> Self {
        Self {
            rpm: section.rpm,
            itpm: section.itpm,
            otpm: section.otpm,
            queue_when_limited: section.queue_when_limited,
            max_queue_size: section.max_queue_size,
            queue_timeout_ms: section.queue_timeout_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct UsageLimitSection {
    pub max_input_tokens: Option<u64>,
    pub max_output_tokens: Option<u64>,
    pub max_total_tokens: Option<u64>,
    pub max_cost_usd: Option<f64>,
    pub window: UsageWindow,
}

impl From<&UsageLimitSection> for UsageLimits {
    fn from(section: &UsageLimitSection) -> Self {
        Self {
            max_input_tokens: section.max_input_tokens,
            max_output_tokens: section.max_output_tokens,
            max_total_tokens: section.max_total_tokens,
            max_cost_usd: section.max_cost_usd,
            window: section.window,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Persist usage stats across runs
    pub enabled: bool,
    pub key_prefix: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            key_prefix: "usage".to_string(),
        }
    }
}

impl Config {
    /// Default config file location (~/.config/helmsman/config.toml)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("helmsman").join("config.toml"))
    }

    /// Data directory for the transcript store and usage stats
    pub fn data_dir() -> PathBuf {
        dirs::home_dir()
            .map(|home| home.join(".helmsman"))
            .unwrap_or_else(|| PathBuf::from(".helmsman"))
    }

    /// Resolved transcript store path
    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("chat.db"))
    }

    /// Usage-stat storage lives next to the transcript
    pub fn usage_storage_path(&self) -> PathBuf {
        Self::data_dir().join("usage.json")
    }

    /// Load from a file path; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| HelmsmanError::Config(format!("failed to read config: {e}")))?;
        toml::from_str(&content)
            .map_err(|e| HelmsmanError::Config(format!("failed to parse config: {e}")))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| HelmsmanError::Config(format!("failed to create config dir: {e}")))?;
            }
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| HelmsmanError::Config(format!("failed to serialize config: {e}")))?;
        std::fs::write(path, content)
            .map_err(|e| HelmsmanError::Config(format!("failed to write config: {e}")))
    }
}
