// src/pipeline/scheduler.rs

//! Periodic pass driver and manual triggers.
//!
//! A pass walks active sources by descending priority, then name, and syncs
//! each due link one at a time. Two guards keep passes exclusive: an
//! in-process flag and a cross-process [`PassLock`]. Either one being held
//! skips the pass instead of queueing it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::{AppError, Result};
use crate::models::{RunStatus, RunTrigger, SyncRun};
use crate::pipeline::sync::LinkSyncer;
use crate::storage::{PassLock, SyncStore};

/// Why a pass did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another pass is still running in this process
    InFlight,
    /// Another process holds the pass lock
    LockHeld,
}

/// Result of one pass over all due links.
#[derive(Debug, Clone, Default)]
pub struct PassReport {
    pub skipped: Option<SkipReason>,
    pub runs: Vec<SyncRun>,
}

impl PassReport {
    fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            runs: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> usize {
        self.runs
            .iter()
            .filter(|r| r.status == RunStatus::Success)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.runs
            .iter()
            .filter(|r| r.status == RunStatus::Failed)
            .count()
    }
}

/// Clears the in-flight flag when a pass ends, however it ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs passes and manual triggers against one store.
pub struct SyncEngine {
    syncer: LinkSyncer,
    lock: Arc<dyn PassLock>,
    in_flight: AtomicBool,
}

impl SyncEngine {
    pub fn new(syncer: LinkSyncer, lock: Arc<dyn PassLock>) -> Self {
        Self {
            syncer,
            lock,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn syncer(&self) -> &LinkSyncer {
        &self.syncer
    }

    fn store(&self) -> &Arc<dyn SyncStore> {
        self.syncer.store()
    }

    /// One pass over every due link of every active source.
    pub async fn run_pass(&self, trigger: RunTrigger) -> Result<PassReport> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::info!("Sync pass skipped: previous pass still running");
            return Ok(PassReport::skipped(SkipReason::InFlight));
        }
        let _in_flight = InFlight(&self.in_flight);

        let Some(_lock) = self.lock.try_acquire().await? else {
            log::info!("Sync pass skipped: lock held by another process");
            return Ok(PassReport::skipped(SkipReason::LockHeld));
        };

        let started = Utc::now();
        let sources = self.store().active_sources().await?;
        log::info!("Sync pass started: {} active source(s)", sources.len());

        let mut report = PassReport::default();
        for source in &sources {
            let links = self.store().due_links(&source.id, Utc::now()).await?;
            if links.is_empty() {
                continue;
            }
            log::debug!("Source {}: {} due link(s)", source.id, links.len());

            for link in links {
                let (link_id, url) = (link.id, link.url.clone());
                match self.syncer.sync_link(source, link, trigger).await {
                    Ok(run) => report.runs.push(run),
                    Err(e) => log::error!("Link {} ({}) aborted: {}", link_id, url, e),
                }
            }
        }

        log::info!(
            "Sync pass finished in {}s: {} run(s), {} succeeded, {} failed",
            (Utc::now() - started).num_seconds(),
            report.runs.len(),
            report.succeeded(),
            report.failed()
        );
        Ok(report)
    }

    /// Sync one link now, ignoring its schedule.
    ///
    /// Takes neither the in-flight flag nor the pass lock, so it may overlap
    /// a running pass and fetch the same link twice.
    pub async fn trigger_link(&self, link_id: u64) -> Result<SyncRun> {
        let link = self
            .store()
            .get_link(link_id)
            .await?
            .ok_or_else(|| AppError::not_found("link", link_id))?;
        let source = self
            .store()
            .get_source(&link.source_id)
            .await?
            .ok_or_else(|| AppError::not_found("source", &link.source_id))?;
        if !source.is_active {
            log::warn!("Source {} is inactive; syncing link {} anyway", source.id, link_id);
        }
        self.syncer.sync_link(&source, link, RunTrigger::Manual).await
    }

    /// Manual pass over all due links, under the usual guards.
    pub async fn trigger_all(&self) -> Result<PassReport> {
        self.run_pass(RunTrigger::Manual).await
    }
}

/// Timer that drives [`SyncEngine::run_pass`].
pub struct Scheduler {
    engine: Arc<SyncEngine>,
    interval: Duration,
    running: Option<(watch::Sender<bool>, JoinHandle<()>)>,
}

impl Scheduler {
    pub fn new(engine: Arc<SyncEngine>, interval: Duration) -> Self {
        Self {
            engine,
            interval,
            running: None,
        }
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Spawn the timer task. The first pass runs immediately.
    pub fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Err(AppError::validation("scheduler already started"));
        }
        if self.interval.is_zero() {
            return Err(AppError::config("scheduler interval must be > 0"));
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let engine = Arc::clone(&self.engine);
        let period = self.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = engine.run_pass(RunTrigger::Scheduled).await {
                            log::error!("Sync pass failed: {}", e);
                        }
                    }
                    _ = stop_rx.changed() => break,
                }
            }
            log::info!("Scheduler stopped");
        });

        log::info!("Scheduler started (every {}s)", period.as_secs());
        self.running = Some((stop_tx, handle));
        Ok(())
    }

    /// Cancel the timer. A pass already running finishes first.
    pub async fn stop(&mut self) {
        let Some((stop_tx, handle)) = self.running.take() else {
            return;
        };
        let _ = stop_tx.send(true);
        if let Err(e) = handle.await {
            log::error!("Scheduler task ended abnormally: {}", e);
        }
    }
}
