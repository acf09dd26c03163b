// src/models/edition.rs

//! Event series, their yearly editions, and field provenance.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{EditionFields, FieldMap, SourceType, TrackedField};

/// A recurring event identity, independent of any year.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSeries {
    pub id: String,

    /// Unique canonical name (e.g., "Tokyo Marathon")
    pub canonical_name: String,
}

/// Identity of an Edition row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EditionKey {
    pub series_id: String,
    pub year: i32,
}

impl EditionKey {
    pub fn new(series_id: impl Into<String>, year: i32) -> Self {
        Self {
            series_id: series_id.into(),
            year,
        }
    }
}

/// Provenance stamped onto a field when a merge writes it.
///
/// The rank is recorded at write time and never recomputed, so later
/// priority edits do not reinterpret earlier merges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSourceInfo {
    pub source_id: String,
    pub source_type: SourceType,
    pub priority: i64,
    pub rank: i64,
    pub updated_at: DateTime<Utc>,
    pub value: String,
}

/// Provenance per trackable field.
pub type FieldSources = FieldMap<FieldSourceInfo>;

/// One year's concrete instance of a series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edition {
    pub series_id: String,
    pub year: i32,

    #[serde(default)]
    pub fields: EditionFields,

    /// Only fields written by a successful merge appear here
    #[serde(default)]
    pub field_sources: FieldSources,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Edition {
    pub fn new(key: &EditionKey, now: DateTime<Utc>) -> Self {
        Self {
            series_id: key.series_id.clone(),
            year: key.year,
            fields: EditionFields::default(),
            field_sources: FieldSources::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> EditionKey {
        EditionKey::new(self.series_id.clone(), self.year)
    }
}

/// Outcome of merging one update into an Edition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeAction {
    Inserted,
    Updated,
    Unchanged,
}

impl MergeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeAction::Inserted => "inserted",
            MergeAction::Updated => "updated",
            MergeAction::Unchanged => "unchanged",
        }
    }
}

impl fmt::Display for MergeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rejected incoming value that disagreed with a stored one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldConflict {
    pub field: TrackedField,
    pub existing_value: String,

    /// Absent when the stored value predates provenance tracking
    pub existing_source: Option<FieldSourceInfo>,

    pub incoming_value: String,
    pub incoming_source_id: String,
    pub incoming_source_type: SourceType,
    pub incoming_rank: i64,
}
