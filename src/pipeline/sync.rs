// src/pipeline/sync.rs

//! Per-link pipeline: fetch with retry, detect change, archive, extract, merge.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::{AppError, Result};
use crate::models::{
    EditionKey, ExtractionMeta, Link, MergeAction, NewSnapshot, RawSnapshot, RunStatus,
    RunTrigger, SnapshotStatus, Source, SyncRun,
};
use crate::pipeline::change::{content_hash, has_changed};
use crate::services::extractor::{Extractor, date_year};
use crate::services::fetcher::{FetchedPage, PageFetcher};
use crate::services::merge::{FieldUpdate, Provenance};
use crate::storage::SyncStore;

/// What extraction and merge made of one snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotOutcome {
    /// Fields were merged into the Edition for `year`.
    Merged {
        year: i32,
        action: MergeAction,
        conflicts: usize,
    },
    /// No race date was found; the snapshot waits for an operator.
    NeedsReview,
    /// The merge could not be written.
    Failed(String),
}

/// Runs the fetch-to-merge pipeline for single links.
pub struct LinkSyncer {
    store: Arc<dyn SyncStore>,
    fetcher: Arc<dyn PageFetcher>,
    extractor: Extractor,
}

impl LinkSyncer {
    pub fn new(store: Arc<dyn SyncStore>, fetcher: Arc<dyn PageFetcher>) -> Self {
        Self {
            store,
            fetcher,
            extractor: Extractor,
        }
    }

    pub fn store(&self) -> &Arc<dyn SyncStore> {
        &self.store
    }

    /// Sync one link and return its finished run.
    ///
    /// Fetch and merge failures end up in the run; only storage errors are
    /// returned as `Err`.
    pub async fn sync_link(
        &self,
        source: &Source,
        mut link: Link,
        trigger: RunTrigger,
    ) -> Result<SyncRun> {
        let mut run = self.store.start_run(link.id, trigger, Utc::now()).await?;
        log::debug!(
            "Run {} started for link {} ({}, {:?} source)",
            run.id,
            link.id,
            link.url,
            source.strategy
        );

        let page = match self.fetch_with_retry(source, &link, &mut run).await? {
            Ok(page) => page,
            Err(message) => {
                let now = Utc::now();
                log::error!("Link {} ({}) failed: {}", link.id, link.url, message);
                link.last_error = Some(message.clone());
                link.mark_checked(now, source.min_interval_secs);
                self.store.record_check(&link).await?;
                run.fail(message, now)?;
                self.store.save_run(&run).await?;
                return Ok(run);
            }
        };

        let now = Utc::now();
        if page.truncated {
            log::warn!("Link {} body exceeded the size cap and was truncated", link.id);
        }
        let hash = content_hash(&page.body);
        link.last_http_status = Some(page.status);
        link.mark_checked(now, source.min_interval_secs);

        if !has_changed(link.last_hash.as_deref(), &hash) {
            log::debug!("Link {} unchanged", link.id);
            link.last_error = None;
            self.store.record_check(&link).await?;
            run.counts.unchanged = 1;
            run.succeed("content unchanged", now)?;
            self.store.save_run(&run).await?;
            return Ok(run);
        }

        let snapshot = self
            .store
            .insert_snapshot(NewSnapshot {
                link_id: link.id,
                series_id: link.series_id.clone(),
                source_id: source.id.clone(),
                url: page.url,
                http_status: page.status,
                content_type: page.content_type,
                body: page.body,
                truncated: page.truncated,
                content_hash: hash.clone(),
                fetched_at: now,
            })
            .await?;
        run.snapshot_id = Some(snapshot.id);
        let snapshot_id = snapshot.id;

        match self.process_snapshot(source, snapshot, now).await? {
            SnapshotOutcome::Merged {
                year,
                action,
                conflicts,
            } => {
                link.last_hash = Some(hash);
                link.last_error = None;
                match action {
                    MergeAction::Inserted => run.counts.new = 1,
                    MergeAction::Updated => run.counts.updated = 1,
                    MergeAction::Unchanged => run.counts.unchanged = 1,
                }
                run.succeed(
                    format!("edition {year} {action}, {conflicts} conflict(s)"),
                    Utc::now(),
                )?;
            }
            SnapshotOutcome::NeedsReview => {
                link.last_hash = Some(hash);
                link.last_error = None;
                run.succeed(
                    format!("no race date, snapshot {snapshot_id} needs review"),
                    Utc::now(),
                )?;
            }
            SnapshotOutcome::Failed(message) => {
                // Keep the old hash so the next pass extracts this content again.
                link.last_error = Some(message.clone());
                run.fail(message, Utc::now())?;
            }
        }

        self.store.record_check(&link).await?;
        self.store.save_run(&run).await?;
        Ok(run)
    }

    /// Up to `max_attempts` GETs with linear backoff between them.
    ///
    /// The inner `Err` carries the last fetch error once attempts run out or
    /// a non-retryable error occurs.
    async fn fetch_with_retry(
        &self,
        source: &Source,
        link: &Link,
        run: &mut SyncRun,
    ) -> Result<std::result::Result<FetchedPage, String>> {
        let max_attempts = source.max_attempts();

        for attempt in 1..=max_attempts {
            run.attempt = attempt;
            match self.fetcher.fetch(&link.url, source.request_timeout()).await {
                Ok(page) => {
                    if !(200..300).contains(&page.status) {
                        log::info!(
                            "Link {} returned HTTP {}, processing body anyway",
                            link.id,
                            page.status
                        );
                    }
                    return Ok(Ok(page));
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = source.backoff_after(attempt);
                    log::warn!(
                        "Link {} attempt {}/{} failed: {}; retrying in {:?}",
                        link.id,
                        attempt,
                        max_attempts,
                        e,
                        delay
                    );
                    run.advance(RunStatus::Retrying, Utc::now())?;
                    self.store.save_run(run).await?;
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => return Ok(Err(e.to_string())),
            }
        }

        Ok(Err(format!("gave up after {max_attempts} attempt(s)")))
    }

    /// Extract fields from an archived snapshot and merge them.
    ///
    /// Settles the snapshot status and persists it.
    pub async fn process_snapshot(
        &self,
        source: &Source,
        mut snapshot: RawSnapshot,
        now: DateTime<Utc>,
    ) -> Result<SnapshotOutcome> {
        let extraction = self
            .extractor
            .extract(&snapshot.body, &snapshot.url, &source.extraction);
        let mut meta = ExtractionMeta {
            methods: extraction.methods.clone(),
            ..Default::default()
        };

        let Some(year) = extraction.race_date().and_then(date_year) else {
            log::info!(
                "Snapshot {} from {}: no race date, queued for review",
                snapshot.id,
                snapshot.url
            );
            snapshot.extraction = Some(meta);
            settle(
                &mut snapshot,
                SnapshotStatus::NeedsReview,
                Some("no race date extracted".into()),
                now,
            )?;
            self.store.save_snapshot(&snapshot).await?;
            return Ok(SnapshotOutcome::NeedsReview);
        };

        meta.year = Some(year);
        let key = EditionKey::new(snapshot.series_id.clone(), year);
        let update = FieldUpdate {
            fields: extraction.fields,
            provenance: Provenance::of(source),
        };

        match self.store.merge_edition(&key, &update, now).await {
            Ok(result) => {
                for conflict in &result.conflicts {
                    log::warn!(
                        "Conflict on {}/{} {}: kept '{}', rejected '{}' from {} (rank {})",
                        key.series_id,
                        key.year,
                        conflict.field,
                        conflict.existing_value,
                        conflict.incoming_value,
                        conflict.incoming_source_id,
                        conflict.incoming_rank
                    );
                }
                let outcome = SnapshotOutcome::Merged {
                    year,
                    action: result.action,
                    conflicts: result.conflicts.len(),
                };
                meta.action = Some(result.action);
                meta.conflicts = result.conflicts;
                snapshot.extraction = Some(meta);
                settle(&mut snapshot, SnapshotStatus::Processed, None, now)?;
                self.store.save_snapshot(&snapshot).await?;
                Ok(outcome)
            }
            Err(e) if snapshot.status.can_transition_to(SnapshotStatus::Failed) => {
                log::error!("Snapshot {}: merge failed: {}", snapshot.id, e);
                let message = e.to_string();
                snapshot.extraction = Some(meta);
                snapshot.transition(SnapshotStatus::Failed, Some(message.clone()), now)?;
                self.store.save_snapshot(&snapshot).await?;
                Ok(SnapshotOutcome::Failed(message))
            }
            Err(e) => Err(e),
        }
    }

    /// Re-extract an archived snapshot with its Source's current rules.
    pub async fn reprocess_snapshot(&self, snapshot_id: u64) -> Result<SnapshotOutcome> {
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
        let source = self
            .store
            .get_source(&snapshot.source_id)
            .await?
            .ok_or_else(|| AppError::not_found("source", &snapshot.source_id))?;

        log::info!("Reprocessing snapshot {} with rules of {}", snapshot.id, source.id);
        self.process_snapshot(&source, snapshot, Utc::now()).await
    }
}

/// Move to `next`, or only refresh the note when already there.
fn settle(
    snapshot: &mut RawSnapshot,
    next: SnapshotStatus,
    note: Option<String>,
    now: DateTime<Utc>,
) -> Result<()> {
    if snapshot.status == next {
        snapshot.note = note;
        return Ok(());
    }
    snapshot.transition(next, note, now)
}
