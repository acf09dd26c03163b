// src/models/run.rs

//! Sync run bookkeeping.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Status of a fetch attempt sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Retrying,
    Success,
    Failed,
}

impl RunStatus {
    /// Transitions only move forward: running, retrying*, then a final state.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Running | Retrying, Retrying | Success | Failed)
        )
    }

    pub fn is_final(&self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Retrying => "retrying",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunTrigger {
    Scheduled,
    Manual,
}

/// Per-run outcome counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub new: u32,
    pub updated: u32,
    pub unchanged: u32,
}

/// One fetch attempt sequence for a link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: u64,
    pub link_id: u64,
    pub trigger: RunTrigger,
    pub status: RunStatus,

    /// Number of fetch attempts made so far
    pub attempt: u32,

    #[serde(default)]
    pub counts: RunCounts,

    #[serde(default)]
    pub message: Option<String>,

    #[serde(default)]
    pub error_message: Option<String>,

    #[serde(default)]
    pub snapshot_id: Option<u64>,

    pub started_at: DateTime<Utc>,

    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl SyncRun {
    pub fn start(id: u64, link_id: u64, trigger: RunTrigger, now: DateTime<Utc>) -> Self {
        Self {
            id,
            link_id,
            trigger,
            status: RunStatus::Running,
            attempt: 0,
            counts: RunCounts::default(),
            message: None,
            error_message: None,
            snapshot_id: None,
            started_at: now,
            finished_at: None,
        }
    }

    /// Move to `next`; final states stamp `finished_at`.
    pub fn advance(&mut self, next: RunStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(AppError::validation(format!(
                "run {}: cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        if next.is_final() {
            self.finished_at = Some(now);
        }
        Ok(())
    }

    pub fn succeed(&mut self, message: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        self.advance(RunStatus::Success, now)?;
        self.message = Some(message.into());
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        self.advance(RunStatus::Failed, now)?;
        self.error_message = Some(error.into());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retrying_may_repeat_before_success() {
        let now = Utc::now();
        let mut run = SyncRun::start(1, 1, RunTrigger::Scheduled, now);
        run.advance(RunStatus::Retrying, now).unwrap();
        run.advance(RunStatus::Retrying, now).unwrap();
        run.succeed("ok", now).unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.finished_at, Some(now));
    }

    #[test]
    fn final_states_are_sticky() {
        let now = Utc::now();
        let mut run = SyncRun::start(1, 1, RunTrigger::Manual, now);
        run.fail("boom", now).unwrap();
        assert!(run.advance(RunStatus::Retrying, now).is_err());
        assert!(run.succeed("late", now).is_err());
        assert_eq!(run.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn cannot_return_to_running() {
        assert!(!RunStatus::Retrying.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Running.can_transition_to(RunStatus::Running));
    }
}
