// src/services/review.rs

//! Operator review of archived snapshots.
//!
//! Corrections go through the same merge engine as crawled values, as a
//! `manual` source, so they outrank every automated source.

use std::sync::Arc;

use chrono::Utc;

use crate::error::{AppError, Result};
use crate::models::{
    EditionFields, EditionKey, ExtractionMethod, RawSnapshot, SnapshotStatus, TrackedField,
};
use crate::services::extractor::{date_year, normalize_date};
use crate::services::merge::{FieldUpdate, MergeResult, Provenance};
use crate::storage::SyncStore;

/// Field values supplied by an operator for one snapshot.
#[derive(Debug, Clone, Default)]
pub struct Correction {
    /// Edition year; taken from `fields.race_date` when absent
    pub year: Option<i32>,
    pub fields: EditionFields,
    pub operator: String,
}

pub struct ReviewQueue {
    store: Arc<dyn SyncStore>,
}

impl ReviewQueue {
    pub fn new(store: Arc<dyn SyncStore>) -> Self {
        Self { store }
    }

    pub async fn list(&self, status: SnapshotStatus) -> Result<Vec<RawSnapshot>> {
        self.store.snapshots_by_status(status).await
    }

    /// Merge corrected values as a manual source and mark the snapshot processed.
    pub async fn correct(&self, snapshot_id: u64, correction: Correction) -> Result<MergeResult> {
        let operator = correction.operator.trim();
        if operator.is_empty() {
            return Err(AppError::validation("operator name is required"));
        }

        let mut snapshot = self.open(snapshot_id).await?;

        let mut fields = correction.fields.normalized();
        if let Some(raw) = fields.race_date.take() {
            let date = normalize_date(&raw)
                .ok_or_else(|| AppError::validation(format!("'{raw}' is not a valid date")))?;
            fields.race_date = Some(date);
        }
        if fields.is_empty() {
            return Err(AppError::validation("correction has no field values"));
        }

        let year = correction
            .year
            .or_else(|| fields.race_date.as_deref().and_then(date_year))
            .ok_or_else(|| AppError::validation("year is required without a race date"))?;

        let now = Utc::now();
        let key = EditionKey::new(snapshot.series_id.clone(), year);
        let update = FieldUpdate {
            fields: fields.clone(),
            provenance: Provenance::manual(operator),
        };
        let result = self.store.merge_edition(&key, &update, now).await?;

        let mut meta = snapshot.extraction.take().unwrap_or_default();
        for field in TrackedField::ALL {
            if fields.get(field).is_some() {
                meta.methods.set(field, Some(ExtractionMethod::Manual));
            }
        }
        meta.year = Some(year);
        meta.action = Some(result.action);
        meta.conflicts = result.conflicts.clone();
        snapshot.extraction = Some(meta);
        snapshot.transition(
            SnapshotStatus::Processed,
            Some(format!("corrected by {operator}")),
            now,
        )?;
        self.store.save_snapshot(&snapshot).await?;

        log::info!(
            "Snapshot {} corrected by {}: edition {}/{} {}",
            snapshot.id,
            operator,
            key.series_id,
            key.year,
            result.action
        );
        Ok(result)
    }

    /// Close a snapshot without merging anything.
    pub async fn ignore(&self, snapshot_id: u64, reason: Option<String>) -> Result<RawSnapshot> {
        let mut snapshot = self.open(snapshot_id).await?;
        snapshot.transition(SnapshotStatus::Ignored, reason, Utc::now())?;
        self.store.save_snapshot(&snapshot).await?;
        log::info!("Snapshot {} ignored", snapshot.id);
        Ok(snapshot)
    }

    async fn open(&self, snapshot_id: u64) -> Result<RawSnapshot> {
        let snapshot = self
            .store
            .get_snapshot(snapshot_id)
            .await?
            .ok_or_else(|| AppError::not_found("snapshot", snapshot_id))?;
        if snapshot.status.is_terminal() {
            return Err(AppError::validation(format!(
                "snapshot {} is already {}",
                snapshot.id, snapshot.status
            )));
        }
        Ok(snapshot)
    }
}
