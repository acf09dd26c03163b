// src/models/source.rs

//! Crawl sources and their authority metadata.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::ExtractionConfig;

/// Upper bound (inclusive) of a Source priority.
///
/// Priorities stay below the type weight scale so that the source type
/// always dominates the authority rank.
pub const MAX_PRIORITY: i64 = 9_999;

/// Longest allowed gap between checks of one link (ten years).
pub const MAX_INTERVAL_SECS: u64 = 10 * 366 * 24 * 60 * 60;

/// Kind of publisher behind a Source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Official,
    Platform,
    Search,
    Social,
    Manual,
    #[default]
    Unknown,
}

impl SourceType {
    /// Authority weight of the type; multiplied by the rank scale.
    pub fn weight(&self) -> i64 {
        match self {
            SourceType::Manual => 1000,
            SourceType::Official => 300,
            SourceType::Platform => 200,
            SourceType::Search => 100,
            SourceType::Social => 50,
            SourceType::Unknown => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Official => "official",
            SourceType::Platform => "platform",
            SourceType::Search => "search",
            SourceType::Social => "social",
            SourceType::Manual => "manual",
            SourceType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content format served by a Source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum FetchStrategy {
    #[default]
    Html,
    Rss,
    Api,
}

/// A crawl source configured by operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    /// Stable identifier (e.g., "runjapan")
    pub id: String,

    /// Display name; secondary ordering key within a pass
    pub name: String,

    #[serde(default, rename = "type")]
    pub source_type: SourceType,

    #[serde(default)]
    pub strategy: FetchStrategy,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(default)]
    pub priority: i64,

    #[serde(default = "defaults::active")]
    pub is_active: bool,

    /// Maximum fetch attempts per run
    #[serde(default = "defaults::retry_max")]
    pub retry_max: u32,

    /// Backoff unit; attempt `n` waits `n` units before the next try
    #[serde(default = "defaults::retry_backoff")]
    pub retry_backoff_secs: u64,

    #[serde(default = "defaults::request_timeout")]
    pub request_timeout_ms: u64,

    /// Minimum gap between checks of one link; zero means every pass
    #[serde(default)]
    pub min_interval_secs: u64,

    #[serde(default)]
    pub extraction: ExtractionConfig,
}

impl Source {
    /// Create an active source with default knobs.
    pub fn new(id: impl Into<String>, name: impl Into<String>, source_type: SourceType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            source_type,
            strategy: FetchStrategy::default(),
            base_url: None,
            priority: 0,
            is_active: true,
            retry_max: defaults::retry_max(),
            retry_backoff_secs: defaults::retry_backoff(),
            request_timeout_ms: defaults::request_timeout(),
            min_interval_secs: 0,
            extraction: ExtractionConfig::default(),
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Attempts per run; at least one.
    pub fn max_attempts(&self) -> u32 {
        self.retry_max.max(1)
    }

    /// Linear backoff before the attempt following `attempt`.
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        Duration::from_secs(self.retry_backoff_secs.saturating_mul(u64::from(attempt)))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Write-time validation of the operator-editable fields.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(AppError::validation("source id is empty"));
        }
        if self.name.trim().is_empty() {
            return Err(AppError::validation(format!("source {}: name is empty", self.id)));
        }
        if !(0..=MAX_PRIORITY).contains(&self.priority) {
            return Err(AppError::validation(format!(
                "source {}: priority {} outside 0..={MAX_PRIORITY}",
                self.id, self.priority
            )));
        }
        if self.min_interval_secs > MAX_INTERVAL_SECS {
            return Err(AppError::validation(format!(
                "source {}: min_interval_secs {} exceeds {MAX_INTERVAL_SECS}",
                self.id, self.min_interval_secs
            )));
        }
        if self.request_timeout_ms == 0 {
            return Err(AppError::validation(format!(
                "source {}: request_timeout_ms must be > 0",
                self.id
            )));
        }
        if let Some(base_url) = &self.base_url {
            url::Url::parse(base_url)?;
        }
        self.extraction.validate().map_err(|e| {
            AppError::validation(format!("source {}: extraction config: {e}", self.id))
        })
    }
}

mod defaults {
    pub fn active() -> bool {
        true
    }
    pub fn retry_max() -> u32 {
        3
    }
    pub fn retry_backoff() -> u64 {
        5
    }
    pub fn request_timeout() -> u64 {
        15_000
    }
}
