//! Persistence for the sync engine.
//!
//! [`SyncStore`] is the only way the pipeline touches persisted state.
//! Nothing about links, editions or runs is cached in memory between
//! calls, so a restart loses in-flight progress but never correctness.
//!
//! ## Directory Structure
//!
//! ```text
//! storage/
//! ├── state.json            # sources, series, links, editions, runs, snapshot rows
//! ├── state.lock            # serializes writers of state.json across processes
//! ├── sync.lock             # held by the process running a pass
//! └── snapshots/
//!     └── {id}.body         # archived page bodies
//! ```

pub mod local;
pub mod lock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{AppError, Result};
use crate::models::{
    Edition, EditionKey, EventSeries, Link, NewLink, NewSnapshot, RawSnapshot, RunTrigger,
    SnapshotStatus, Source, SyncRun,
};
use crate::services::merge::{FieldUpdate, MergeResult};

pub use local::LocalStore;
pub use lock::{FileLock, LockGuard, PassLock};

/// Run blocking file work on tokio's blocking pool.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AppError::Io(std::io::Error::other(e)))?
}

/// Storage backend for sources, links, editions, snapshots and runs.
#[async_trait]
pub trait SyncStore: Send + Sync {
    /// Insert or replace a Source after validating it.
    async fn upsert_source(&self, source: &Source) -> Result<()>;

    async fn get_source(&self, id: &str) -> Result<Option<Source>>;

    /// Active sources ordered by descending priority, then name.
    async fn active_sources(&self) -> Result<Vec<Source>>;

    /// Insert or rename a series; canonical names stay unique.
    async fn upsert_series(&self, series: &EventSeries) -> Result<()>;

    async fn get_series(&self, id: &str) -> Result<Option<EventSeries>>;

    /// Insert a link or update the URL and primary flag of the existing
    /// (series, source) binding. Hash and schedule state are kept.
    async fn upsert_link(&self, link: &NewLink, now: DateTime<Utc>) -> Result<Link>;

    async fn get_link(&self, id: u64) -> Result<Option<Link>>;

    /// Links of `source_id` due at `now`, primary first, then oldest first.
    async fn due_links(&self, source_id: &str, now: DateTime<Utc>) -> Result<Vec<Link>>;

    /// Record the outcome of a check: hash, HTTP status, error and schedule.
    ///
    /// Registration fields (`url`, `is_primary`) are left as stored.
    async fn record_check(&self, link: &Link) -> Result<()>;

    async fn get_edition(&self, key: &EditionKey) -> Result<Option<Edition>>;

    /// Run the field merge against the stored Edition and persist the result
    /// as one atomic step.
    async fn merge_edition(
        &self,
        key: &EditionKey,
        update: &FieldUpdate,
        now: DateTime<Utc>,
    ) -> Result<MergeResult>;

    /// Archive a fetch as a new `pending` snapshot.
    async fn insert_snapshot(&self, snapshot: NewSnapshot) -> Result<RawSnapshot>;

    /// Snapshot row with its body.
    async fn get_snapshot(&self, id: u64) -> Result<Option<RawSnapshot>>;

    /// Persist status and extraction metadata. The body is immutable.
    async fn save_snapshot(&self, snapshot: &RawSnapshot) -> Result<()>;

    /// Snapshot rows (without bodies) in the given status, oldest first.
    async fn snapshots_by_status(&self, status: SnapshotStatus) -> Result<Vec<RawSnapshot>>;

    async fn snapshots_for_link(&self, link_id: u64) -> Result<Vec<RawSnapshot>>;

    /// Record a new `running` SyncRun.
    async fn start_run(
        &self,
        link_id: u64,
        trigger: RunTrigger,
        now: DateTime<Utc>,
    ) -> Result<SyncRun>;

    async fn save_run(&self, run: &SyncRun) -> Result<()>;

    async fn get_run(&self, id: u64) -> Result<Option<SyncRun>>;

    async fn runs_for_link(&self, link_id: u64) -> Result<Vec<SyncRun>>;
}
