// src/utils/http.rs

//! HTTP client utilities.

use std::time::Duration;

use crate::error::Result;
use crate::models::{AiConfig, SyncConfig};

/// Create the shared client used for page fetches.
///
/// Per-request timeouts come from each Source, so none is set here.
pub fn create_async_client(config: &SyncConfig) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .user_agent(&config.user_agent)
        .connect_timeout(Duration::from_secs(10))
        .build()?;
    Ok(client)
}

/// Create a client for the rule-generation provider.
pub fn create_ai_client(config: &AiConfig) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?;
    Ok(client)
}
