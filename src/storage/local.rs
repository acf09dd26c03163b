//! Local filesystem storage implementation.
//!
//! All row metadata lives in one `state.json`, replaced atomically on every
//! change. Writers hold an OS lock on `state.lock` for the whole
//! load-modify-write, so several processes can share one directory.
//! Readers need no lock, since the file is only ever swapped by rename.
//! Snapshot bodies are written once to their own files and never rewritten.
//!
//! Finished runs are pruned per link once they exceed the retention limit.
//!
//! ## Storage Layout
//!
//! ```text
//! {root}/
//! ├── state.json
//! ├── state.lock
//! └── snapshots/
//!     └── {id}.body
//! ```

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::sync::Mutex;

use crate::error::{AppError, Result};
use crate::models::{
    Edition, EditionKey, EventSeries, Link, MergeAction, NewLink, NewSnapshot, RawSnapshot,
    RunTrigger, SnapshotStatus, Source, SyncRun,
};
use crate::services::merge::{FieldUpdate, MergeResult, merge_fields};
use crate::storage::lock::{self, LockGuard};
use crate::storage::{SyncStore, blocking};

const STATE_KEY: &str = "state.json";
const STATE_LOCK_KEY: &str = "state.lock";

/// Finished runs kept per link unless configured otherwise.
pub const DEFAULT_RUNS_PER_LINK: usize = 200;

/// Next identifier per table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct Sequences {
    link: u64,
    snapshot: u64,
    run: u64,
}

impl Default for Sequences {
    fn default() -> Self {
        Self {
            link: 1,
            snapshot: 1,
            run: 1,
        }
    }
}

/// Everything persisted in `state.json`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct State {
    #[serde(default)]
    sequences: Sequences,
    #[serde(default)]
    sources: BTreeMap<String, Source>,
    #[serde(default)]
    series: BTreeMap<String, EventSeries>,
    #[serde(default)]
    links: BTreeMap<u64, Link>,
    #[serde(default)]
    editions: Vec<Edition>,
    #[serde(default)]
    snapshots: BTreeMap<u64, RawSnapshot>,
    #[serde(default)]
    runs: BTreeMap<u64, SyncRun>,
}

impl State {
    fn edition_mut(&mut self, key: &EditionKey) -> Option<&mut Edition> {
        self.editions
            .iter_mut()
            .find(|e| e.series_id == key.series_id && e.year == key.year)
    }

    /// Drop the oldest finished runs of a link beyond `keep`.
    fn prune_runs(&mut self, link_id: u64, keep: usize) -> usize {
        let finished: Vec<u64> = self
            .runs
            .values()
            .filter(|r| r.link_id == link_id && r.status.is_final())
            .map(|r| r.id)
            .collect();
        let excess = finished.len().saturating_sub(keep);
        for id in &finished[..excess] {
            self.runs.remove(id);
        }
        excess
    }
}

/// Local filesystem storage backend.
pub struct LocalStore {
    root_dir: PathBuf,
    write_lock: Mutex<()>,
    runs_per_link: usize,
}

impl LocalStore {
    /// Create a new LocalStore rooted at the given directory.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            write_lock: Mutex::new(()),
            runs_per_link: DEFAULT_RUNS_PER_LINK,
        }
    }

    /// Keep at most this many finished runs per link (at least one).
    pub fn with_run_retention(mut self, runs_per_link: usize) -> Self {
        self.runs_per_link = runs_per_link.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// Get the full path for a relative key.
    fn path(&self, key: &str) -> PathBuf {
        self.root_dir.join(key)
    }

    fn body_key(id: u64) -> String {
        format!("snapshots/{id}.body")
    }

    /// Write bytes atomically through a uniquely named temp file.
    async fn write_bytes(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let path = self.path(key);
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root_dir.clone());
        blocking(move || {
            std::fs::create_dir_all(&dir)?;
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(&bytes)?;
            tmp.flush()?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
    }

    /// Exclusive cross-process lock over `state.json` writers.
    async fn lock_state(&self) -> Result<LockGuard> {
        let path = self.path(STATE_LOCK_KEY);
        blocking(move || lock::lock_exclusive(&path)).await
    }

    /// Read bytes, returning None if file doesn't exist.
    async fn read_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AppError::Io(e)),
        }
    }

    async fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.read_bytes(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn load(&self) -> Result<State> {
        Ok(self.read_json(STATE_KEY).await?.unwrap_or_default())
    }

    async fn persist(&self, state: &State) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(state)?;
        self.write_bytes(STATE_KEY, bytes).await
    }

    /// Read-only view of the current state.
    async fn read<T>(&self, f: impl FnOnce(&State) -> T + Send) -> Result<T> {
        let state = self.load().await?;
        Ok(f(&state))
    }

    /// Load, mutate and persist the state as one step.
    ///
    /// Nothing is written when `f` fails.
    async fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut State) -> Result<T> + Send,
        T: Send,
    {
        let _local = self.write_lock.lock().await;
        let _state_lock = self.lock_state().await?;
        let mut state = self.load().await?;
        let out = f(&mut state)?;
        self.persist(&state).await?;
        Ok(out)
    }
}

#[async_trait]
impl SyncStore for LocalStore {
    async fn upsert_source(&self, source: &Source) -> Result<()> {
        source.validate()?;
        let source = source.clone();
        self.update(move |state| {
            state.sources.insert(source.id.clone(), source);
            Ok(())
        })
        .await
    }

    async fn get_source(&self, id: &str) -> Result<Option<Source>> {
        self.read(|state| state.sources.get(id).cloned()).await
    }

    async fn active_sources(&self) -> Result<Vec<Source>> {
        self.read(|state| {
            let mut sources: Vec<Source> = state
                .sources
                .values()
                .filter(|s| s.is_active)
                .cloned()
                .collect();
            sources.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
            sources
        })
        .await
    }

    async fn upsert_series(&self, series: &EventSeries) -> Result<()> {
        let name = series.canonical_name.trim();
        if series.id.trim().is_empty() || name.is_empty() {
            return Err(AppError::validation("series id and canonical name are required"));
        }
        let series = EventSeries {
            id: series.id.clone(),
            canonical_name: name.to_string(),
        };
        self.update(move |state| {
            if let Some(other) = state
                .series
                .values()
                .find(|s| s.canonical_name == series.canonical_name && s.id != series.id)
            {
                return Err(AppError::validation(format!(
                    "series name '{}' already belongs to {}",
                    series.canonical_name, other.id
                )));
            }
            state.series.insert(series.id.clone(), series);
            Ok(())
        })
        .await
    }

    async fn get_series(&self, id: &str) -> Result<Option<EventSeries>> {
        self.read(|state| state.series.get(id).cloned()).await
    }

    async fn upsert_link(&self, link: &NewLink, now: DateTime<Utc>) -> Result<Link> {
        url::Url::parse(&link.url)?;
        let link = link.clone();
        self.update(move |state| {
            if !state.series.contains_key(&link.series_id) {
                return Err(AppError::not_found("series", &link.series_id));
            }
            if !state.sources.contains_key(&link.source_id) {
                return Err(AppError::not_found("source", &link.source_id));
            }

            let existing = state
                .links
                .values_mut()
                .find(|l| l.series_id == link.series_id && l.source_id == link.source_id);
            if let Some(existing) = existing {
                existing.url = link.url;
                existing.is_primary = link.is_primary;
                return Ok(existing.clone());
            }

            let id = state.sequences.link;
            state.sequences.link += 1;
            let created = Link {
                id,
                series_id: link.series_id,
                source_id: link.source_id,
                url: link.url,
                is_primary: link.is_primary,
                last_hash: None,
                last_http_status: None,
                last_error: None,
                last_checked_at: None,
                next_check_at: None,
                created_at: now,
            };
            state.links.insert(id, created.clone());
            Ok(created)
        })
        .await
    }

    async fn get_link(&self, id: u64) -> Result<Option<Link>> {
        self.read(|state| state.links.get(&id).cloned()).await
    }

    async fn due_links(&self, source_id: &str, now: DateTime<Utc>) -> Result<Vec<Link>> {
        self.read(|state| {
            let mut links: Vec<Link> = state
                .links
                .values()
                .filter(|l| l.source_id == source_id && l.is_due(now))
                .cloned()
                .collect();
            links.sort_by(|a, b| {
                b.is_primary
                    .cmp(&a.is_primary)
                    .then_with(|| a.created_at.cmp(&b.created_at))
                    .then_with(|| a.id.cmp(&b.id))
            });
            links
        })
        .await
    }

    async fn record_check(&self, link: &Link) -> Result<()> {
        let link = link.clone();
        self.update(move |state| {
            let slot = state
                .links
                .get_mut(&link.id)
                .ok_or_else(|| AppError::not_found("link", link.id))?;
            slot.last_hash = link.last_hash;
            slot.last_http_status = link.last_http_status;
            slot.last_error = link.last_error;
            slot.last_checked_at = link.last_checked_at;
            slot.next_check_at = link.next_check_at;
            Ok(())
        })
        .await
    }

    async fn get_edition(&self, key: &EditionKey) -> Result<Option<Edition>> {
        self.read(|state| {
            state
                .editions
                .iter()
                .find(|e| e.series_id == key.series_id && e.year == key.year)
                .cloned()
        })
        .await
    }

    async fn merge_edition(
        &self,
        key: &EditionKey,
        update: &FieldUpdate,
        now: DateTime<Utc>,
    ) -> Result<MergeResult> {
        self.update(|state| {
            if !state.series.contains_key(&key.series_id) {
                return Err(AppError::not_found("series", &key.series_id));
            }
            let existing = state.edition_mut(key).map(|e| e.clone());
            let result = merge_fields(existing, key, update, now);

            match (&result.action, &result.edition) {
                (MergeAction::Inserted, Some(edition)) => state.editions.push(edition.clone()),
                (MergeAction::Updated, Some(edition)) => {
                    if let Some(slot) = state.edition_mut(key) {
                        *slot = edition.clone();
                    }
                }
                _ => {}
            }
            Ok(result)
        })
        .await
    }

    async fn insert_snapshot(&self, snapshot: NewSnapshot) -> Result<RawSnapshot> {
        let _local = self.write_lock.lock().await;
        let _state_lock = self.lock_state().await?;
        let mut state = self.load().await?;

        let id = state.sequences.snapshot;
        state.sequences.snapshot += 1;
        let snapshot = RawSnapshot::from_new(id, snapshot);

        // Body first: a row must never point at a missing body.
        self.write_bytes(&Self::body_key(id), snapshot.body.clone().into_bytes())
            .await?;
        state.snapshots.insert(id, snapshot.clone());
        self.persist(&state).await?;
        Ok(snapshot)
    }

    async fn get_snapshot(&self, id: u64) -> Result<Option<RawSnapshot>> {
        let Some(mut snapshot) = self.read(|state| state.snapshots.get(&id).cloned()).await? else {
            return Ok(None);
        };
        let body = self
            .read_bytes(&Self::body_key(id))
            .await?
            .ok_or_else(|| AppError::not_found("snapshot body", id))?;
        snapshot.body = String::from_utf8_lossy(&body).into_owned();
        Ok(Some(snapshot))
    }

    async fn save_snapshot(&self, snapshot: &RawSnapshot) -> Result<()> {
        let snapshot = snapshot.clone();
        self.update(move |state| match state.snapshots.get_mut(&snapshot.id) {
            Some(slot) => {
                *slot = snapshot;
                Ok(())
            }
            None => Err(AppError::not_found("snapshot", snapshot.id)),
        })
        .await
    }

    async fn snapshots_by_status(&self, status: SnapshotStatus) -> Result<Vec<RawSnapshot>> {
        self.read(|state| {
            state
                .snapshots
                .values()
                .filter(|s| s.status == status)
                .cloned()
                .collect()
        })
        .await
    }

    async fn snapshots_for_link(&self, link_id: u64) -> Result<Vec<RawSnapshot>> {
        self.read(|state| {
            state
                .snapshots
                .values()
                .filter(|s| s.link_id == link_id)
                .cloned()
                .collect()
        })
        .await
    }

    async fn start_run(
        &self,
        link_id: u64,
        trigger: RunTrigger,
        now: DateTime<Utc>,
    ) -> Result<SyncRun> {
        let keep = self.runs_per_link;
        self.update(move |state| {
            let pruned = state.prune_runs(link_id, keep);
            if pruned > 0 {
                log::debug!("Pruned {} finished run(s) of link {}", pruned, link_id);
            }
            let id = state.sequences.run;
            state.sequences.run += 1;
            let run = SyncRun::start(id, link_id, trigger, now);
            state.runs.insert(id, run.clone());
            Ok(run)
        })
        .await
    }

    async fn save_run(&self, run: &SyncRun) -> Result<()> {
        let run = run.clone();
        self.update(move |state| match state.runs.get_mut(&run.id) {
            Some(slot) => {
                *slot = run;
                Ok(())
            }
            None => Err(AppError::not_found("run", run.id)),
        })
        .await
    }

    async fn get_run(&self, id: u64) -> Result<Option<SyncRun>> {
        self.read(|state| state.runs.get(&id).cloned()).await
    }

    async fn runs_for_link(&self, link_id: u64) -> Result<Vec<SyncRun>> {
        self.read(|state| {
            state
                .runs
                .values()
                .filter(|r| r.link_id == link_id)
                .cloned()
                .collect()
        })
        .await
    }
}
