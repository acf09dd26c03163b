//! Application configuration structures.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Scheduler, fetch and lock settings
    #[serde(default)]
    pub sync: SyncConfig,

    /// Where persisted state lives
    #[serde(default)]
    pub storage: StorageConfig,

    /// AI-assisted rule generation
    #[serde(default)]
    pub ai: AiConfig,

    /// Log output settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load configuration or return default if loading fails.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(&path).unwrap_or_else(|e| {
            log::warn!(
                "Config load failed from {:?}: {}. Using defaults.",
                path.as_ref(),
                e
            );
            Self::default()
        })
    }

    /// Validate configuration values for basic sanity.
    pub fn validate(&self) -> Result<()> {
        if self.sync.user_agent.trim().is_empty() {
            return Err(AppError::validation("sync.user_agent is empty"));
        }
        if self.sync.interval_secs == 0 {
            return Err(AppError::validation("sync.interval_secs must be > 0"));
        }
        if self.sync.max_body_bytes == 0 {
            return Err(AppError::validation("sync.max_body_bytes must be > 0"));
        }
        if self.storage.runs_per_link == 0 {
            return Err(AppError::validation("storage.runs_per_link must be > 0"));
        }
        if self.ai.max_snippet_chars == 0 {
            return Err(AppError::validation("ai.max_snippet_chars must be > 0"));
        }
        if self.ai.enabled && !AiConfig::SUPPORTED_PROVIDERS.contains(&self.ai.provider.as_str()) {
            return Err(AppError::validation(format!(
                "ai.provider '{}' is not supported",
                self.ai.provider
            )));
        }
        Ok(())
    }
}

/// Scheduler and fetch behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Seconds between scheduled passes
    #[serde(default = "defaults::interval")]
    pub interval_secs: u64,

    /// User-Agent header for HTTP requests
    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,

    /// Fetched bodies are truncated to this many bytes
    #[serde(default = "defaults::max_body_bytes")]
    pub max_body_bytes: usize,
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: defaults::interval(),
            user_agent: defaults::user_agent(),
            max_body_bytes: defaults::max_body_bytes(),
        }
    }
}

/// Persistence location and retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "defaults::storage_dir")]
    pub dir: PathBuf,

    /// Finished sync runs kept per link; older ones are pruned
    #[serde(default = "defaults::runs_per_link")]
    pub runs_per_link: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: defaults::storage_dir(),
            runs_per_link: defaults::runs_per_link(),
        }
    }
}

/// AI-assisted rule template generation.
///
/// Generation is only possible when `enabled` is set and an API key
/// resolves, either literally from `api_key` or from the `api_key_env`
/// environment variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Provider name ("openai")
    #[serde(default = "defaults::ai_provider")]
    pub provider: String,

    #[serde(default = "defaults::ai_model")]
    pub model: String,

    /// Base URL of the OpenAI-compatible API
    #[serde(default = "defaults::ai_base_url")]
    pub base_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Environment variable consulted when `api_key` is absent
    #[serde(default = "defaults::ai_api_key_env")]
    pub api_key_env: String,

    /// Page snippets sent to the provider are capped at this many characters
    #[serde(default = "defaults::ai_max_snippet_chars")]
    pub max_snippet_chars: usize,

    #[serde(default = "defaults::ai_timeout")]
    pub timeout_secs: u64,
}

impl AiConfig {
    pub const SUPPORTED_PROVIDERS: &'static [&'static str] = &["openai"];

    /// Resolve the API key, preferring the literal value over the environment.
    pub fn credentials(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var(&self.api_key_env).ok())
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
    }
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: defaults::ai_provider(),
            model: defaults::ai_model(),
            base_url: defaults::ai_base_url(),
            api_key: None,
            api_key_env: defaults::ai_api_key_env(),
            max_snippet_chars: defaults::ai_max_snippet_chars(),
            timeout_secs: defaults::ai_timeout(),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "defaults::log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::log_level(),
        }
    }
}

mod defaults {
    use std::path::PathBuf;

    // Sync defaults
    pub fn interval() -> u64 {
        300
    }
    pub fn user_agent() -> String {
        "Mozilla/5.0 (compatible; edition-sync/0.1)".into()
    }
    pub fn max_body_bytes() -> usize {
        2 * 1024 * 1024
    }

    pub fn storage_dir() -> PathBuf {
        PathBuf::from("storage")
    }
    pub fn runs_per_link() -> usize {
        200
    }

    // AI defaults
    pub fn ai_provider() -> String {
        "openai".into()
    }
    pub fn ai_model() -> String {
        "gpt-4o-mini".into()
    }
    pub fn ai_base_url() -> String {
        "https://api.openai.com".into()
    }
    pub fn ai_api_key_env() -> String {
        "OPENAI_API_KEY".into()
    }
    pub fn ai_max_snippet_chars() -> usize {
        12_000
    }
    pub fn ai_timeout() -> u64 {
        60
    }

    pub fn log_level() -> String {
        "info".into()
    }
}
