// src/models/snapshot.rs

//! Archived fetch results and their review lifecycle.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::{FieldConflict, FieldMap, MergeAction};

/// Review status of a RawSnapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStatus {
    Pending,
    NeedsReview,
    Processed,
    Ignored,
    Failed,
}

impl SnapshotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotStatus::Pending => "pending",
            SnapshotStatus::NeedsReview => "needs_review",
            SnapshotStatus::Processed => "processed",
            SnapshotStatus::Ignored => "ignored",
            SnapshotStatus::Failed => "failed",
        }
    }

    pub fn can_transition_to(&self, next: SnapshotStatus) -> bool {
        use SnapshotStatus::*;
        match (self, next) {
            (Pending, NeedsReview | Processed | Ignored | Failed) => true,
            (NeedsReview, Processed | Ignored) => true,
            (Failed, NeedsReview | Processed | Ignored) => true,
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SnapshotStatus::Processed | SnapshotStatus::Ignored)
    }
}

impl fmt::Display for SnapshotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SnapshotStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(SnapshotStatus::Pending),
            "needs_review" | "needs-review" => Ok(SnapshotStatus::NeedsReview),
            "processed" => Ok(SnapshotStatus::Processed),
            "ignored" => Ok(SnapshotStatus::Ignored),
            "failed" => Ok(SnapshotStatus::Failed),
            other => Err(AppError::validation(format!("unknown snapshot status '{other}'"))),
        }
    }
}

/// Which extraction stage produced a field value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    StructuredData,
    Regex,
    Rule,
    Manual,
}

/// What happened to a snapshot's extracted facts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionMeta {
    #[serde(default)]
    pub methods: FieldMap<ExtractionMethod>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<MergeAction>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<FieldConflict>,
}

/// Fields supplied when archiving a fetch.
#[derive(Debug, Clone)]
pub struct NewSnapshot {
    pub link_id: u64,
    pub series_id: String,
    pub source_id: String,
    pub url: String,
    pub http_status: u16,
    pub content_type: Option<String>,
    pub body: String,
    /// The body was cut at the fetch size cap
    pub truncated: bool,
    pub content_hash: String,
    pub fetched_at: DateTime<Utc>,
}

/// An archived fetch whose content hash changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSnapshot {
    pub id: u64,
    pub link_id: u64,
    pub series_id: String,
    pub source_id: String,
    pub url: String,
    pub http_status: u16,

    #[serde(default)]
    pub content_type: Option<String>,

    /// Stored apart from the row metadata
    #[serde(skip)]
    pub body: String,

    /// The stored body is only a prefix of the page
    #[serde(default)]
    pub truncated: bool,

    pub content_hash: String,

    #[serde(default)]
    pub extraction: Option<ExtractionMeta>,

    pub status: SnapshotStatus,

    /// Operator or pipeline note for the current status
    #[serde(default)]
    pub note: Option<String>,

    pub fetched_at: DateTime<Utc>,

    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
}

impl RawSnapshot {
    pub fn from_new(id: u64, new: NewSnapshot) -> Self {
        Self {
            id,
            link_id: new.link_id,
            series_id: new.series_id,
            source_id: new.source_id,
            url: new.url,
            http_status: new.http_status,
            content_type: new.content_type,
            body: new.body,
            truncated: new.truncated,
            content_hash: new.content_hash,
            extraction: None,
            status: SnapshotStatus::Pending,
            note: None,
            fetched_at: new.fetched_at,
            processed_at: None,
        }
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub fn transition(
        &mut self,
        next: SnapshotStatus,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(AppError::validation(format!(
                "snapshot {}: cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        self.note = note;
        if matches!(
            next,
            SnapshotStatus::Processed | SnapshotStatus::Ignored | SnapshotStatus::Failed
        ) {
            self.processed_at = Some(now);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> RawSnapshot {
        RawSnapshot::from_new(
            7,
            NewSnapshot {
                link_id: 1,
                series_id: "tokyo".into(),
                source_id: "official".into(),
                url: "https://example.com".into(),
                http_status: 200,
                content_type: Some("text/html".into()),
                body: "<html></html>".into(),
                truncated: false,
                content_hash: "abc".into(),
                fetched_at: Utc::now(),
            },
        )
    }

    #[test]
    fn new_snapshot_is_pending() {
        let snap = snapshot();
        assert_eq!(snap.status, SnapshotStatus::Pending);
        assert!(snap.processed_at.is_none());
    }

    #[test]
    fn review_path_reaches_processed() {
        let mut snap = snapshot();
        snap.transition(SnapshotStatus::NeedsReview, Some("no date".into()), Utc::now())
            .unwrap();
        assert!(snap.processed_at.is_none());
        snap.transition(SnapshotStatus::Processed, None, Utc::now()).unwrap();
        assert!(snap.processed_at.is_some());
        assert!(snap.status.is_terminal());
    }

    #[test]
    fn terminal_states_do_not_move() {
        let mut snap = snapshot();
        snap.transition(SnapshotStatus::Ignored, None, Utc::now()).unwrap();
        assert!(snap.transition(SnapshotStatus::Pending, None, Utc::now()).is_err());
        assert!(snap.transition(SnapshotStatus::Processed, None, Utc::now()).is_err());
    }

    #[test]
    fn needs_review_cannot_fail() {
        assert!(!SnapshotStatus::NeedsReview.can_transition_to(SnapshotStatus::Failed));
        assert!(SnapshotStatus::Failed.can_transition_to(SnapshotStatus::NeedsReview));
    }

    #[test]
    fn status_parses_from_cli_spelling() {
        assert_eq!(
            "needs-review".parse::<SnapshotStatus>().unwrap(),
            SnapshotStatus::NeedsReview
        );
        assert!("done".parse::<SnapshotStatus>().is_err());
    }

    #[test]
    fn body_is_not_part_of_row_json() {
        let json = serde_json::to_value(snapshot()).unwrap();
        assert!(json.get("body").is_none());
        assert_eq!(json["status"], "pending");
    }
}
