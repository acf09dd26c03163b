// src/models/link.rs

//! Per-(series, source) crawl bindings.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A crawlable URL for one series from one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub id: u64,
    pub series_id: String,
    pub source_id: String,
    pub url: String,

    #[serde(default)]
    pub is_primary: bool,

    /// Content hash of the last processed fetch
    #[serde(default)]
    pub last_hash: Option<String>,

    #[serde(default)]
    pub last_http_status: Option<u16>,

    #[serde(default)]
    pub last_error: Option<String>,

    #[serde(default)]
    pub last_checked_at: Option<DateTime<Utc>>,

    /// `None` means due on the next pass
    #[serde(default)]
    pub next_check_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

/// Fields supplied when registering a link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLink {
    #[serde(rename = "series")]
    pub series_id: String,

    #[serde(rename = "source")]
    pub source_id: String,

    pub url: String,

    #[serde(default, rename = "primary")]
    pub is_primary: bool,
}

impl Link {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_check_at.is_none_or(|at| at <= now)
    }

    /// Record a completed check and schedule the next one.
    ///
    /// A zero interval leaves the link due on the following pass; an
    /// interval past the calendar's range saturates at its last instant.
    pub fn mark_checked(&mut self, now: DateTime<Utc>, min_interval_secs: u64) {
        self.last_checked_at = Some(now);
        self.next_check_at = if min_interval_secs == 0 {
            None
        } else {
            let secs = i64::try_from(min_interval_secs).unwrap_or(i64::MAX);
            let next = Duration::try_seconds(secs).and_then(|gap| now.checked_add_signed(gap));
            Some(next.unwrap_or(DateTime::<Utc>::MAX_UTC))
        };
    }
}
