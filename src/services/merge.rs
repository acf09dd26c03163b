// src/services/merge.rs

//! Field merge engine.
//!
//! Reconciles an incoming set of field values into an Edition, one field at
//! a time, using the authority rank recorded on each stored field. Stored
//! values are never overwritten by an equal or lower rank; such
//! disagreements come back as [`FieldConflict`]s instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{
    Edition, EditionFields, EditionKey, FieldConflict, FieldSourceInfo, MAX_PRIORITY,
    MergeAction, Source, SourceType, TrackedField,
};

/// Multiplier applied to the source type weight.
pub const RANK_SCALE: i64 = 10_000;

/// Composite authority score: type weight dominates, priority breaks ties.
pub fn authority_rank(source_type: SourceType, priority: i64) -> i64 {
    source_type.weight() * RANK_SCALE + priority.clamp(0, MAX_PRIORITY)
}

/// Who supplies an update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub source_id: String,
    pub source_type: SourceType,
    pub priority: i64,
}

impl Provenance {
    pub fn of(source: &Source) -> Self {
        Self {
            source_id: source.id.clone(),
            source_type: source.source_type,
            priority: source.priority,
        }
    }

    /// Operator correction; outranks every automated source.
    pub fn manual(operator: &str) -> Self {
        Self {
            source_id: format!("manual:{operator}"),
            source_type: SourceType::Manual,
            priority: 0,
        }
    }

    pub fn rank(&self) -> i64 {
        authority_rank(self.source_type, self.priority)
    }

    fn stamp(&self, value: &str, now: DateTime<Utc>) -> FieldSourceInfo {
        FieldSourceInfo {
            source_id: self.source_id.clone(),
            source_type: self.source_type,
            priority: self.priority,
            rank: self.rank(),
            updated_at: now,
            value: value.to_string(),
        }
    }
}

/// Incoming field values with their provenance.
#[derive(Debug, Clone)]
pub struct FieldUpdate {
    pub fields: EditionFields,
    pub provenance: Provenance,
}

/// Why a field was or was not written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeReason {
    Empty,
    Same,
    HigherPriority,
    Rejected,
}

impl MergeReason {
    pub fn applied(&self) -> bool {
        matches!(self, MergeReason::Empty | MergeReason::HigherPriority)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDecision {
    pub field: TrackedField,
    pub reason: MergeReason,
}

/// Result of one merge pass over an Edition.
#[derive(Debug, Clone)]
pub struct MergeResult {
    pub action: MergeAction,

    /// The row to persist; `None` when nothing exists and nothing was inserted
    pub edition: Option<Edition>,

    pub decisions: Vec<FieldDecision>,
    pub conflicts: Vec<FieldConflict>,
}

/// Merge `update` into `existing` (or a fresh Edition for `key`).
pub fn merge_fields(
    existing: Option<Edition>,
    key: &EditionKey,
    update: &FieldUpdate,
    now: DateTime<Utc>,
) -> MergeResult {
    let incoming = update.fields.clone().normalized();
    let provenance = &update.provenance;

    let Some(mut edition) = existing else {
        if incoming.is_empty() {
            return MergeResult {
                action: MergeAction::Unchanged,
                edition: None,
                decisions: Vec::new(),
                conflicts: Vec::new(),
            };
        }

        let mut edition = Edition::new(key, now);
        let mut decisions = Vec::new();
        for (field, value) in incoming.iter() {
            edition.fields.set(field, Some(value.clone()));
            edition
                .field_sources
                .set(field, Some(provenance.stamp(value, now)));
            decisions.push(FieldDecision {
                field,
                reason: MergeReason::Empty,
            });
        }
        return MergeResult {
            action: MergeAction::Inserted,
            edition: Some(edition),
            decisions,
            conflicts: Vec::new(),
        };
    };

    let rank = provenance.rank();
    let mut decisions = Vec::new();
    let mut conflicts = Vec::new();

    for (field, value) in incoming.iter() {
        let stored = edition
            .fields
            .get(field)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        let stored_source = edition.field_sources.get(field).cloned();

        let reason = match &stored {
            None => MergeReason::Empty,
            Some(current) if current == value => MergeReason::Same,
            // A stored value without provenance predates tracking; any ranked source wins.
            Some(_) if stored_source.as_ref().is_none_or(|s| rank > s.rank) => {
                MergeReason::HigherPriority
            }
            Some(_) => MergeReason::Rejected,
        };

        if reason.applied() {
            edition.fields.set(field, Some(value.clone()));
            edition
                .field_sources
                .set(field, Some(provenance.stamp(value, now)));
        } else if let (MergeReason::Rejected, Some(current)) = (reason, stored) {
            conflicts.push(FieldConflict {
                field,
                existing_value: current,
                existing_source: stored_source,
                incoming_value: value.clone(),
                incoming_source_id: provenance.source_id.clone(),
                incoming_source_type: provenance.source_type,
                incoming_rank: rank,
            });
        }
        decisions.push(FieldDecision { field, reason });
    }

    let changed = decisions.iter().any(|d| d.reason.applied());
    if changed {
        edition.updated_at = now;
    }

    MergeResult {
        action: if changed {
            MergeAction::Updated
        } else {
            MergeAction::Unchanged
        },
        edition: Some(edition),
        decisions,
        conflicts,
    }
}
