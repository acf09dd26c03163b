// src/models/mod.rs

//! Domain models for the sync engine.
//!
//! This module contains all data structures used throughout the application,
//! organized by their primary purpose.

mod config;
mod edition;
mod fields;
mod link;
mod registry;
mod rules;
mod run;
mod snapshot;
mod source;

// Re-export all public types
pub use config::{AiConfig, Config, LoggingConfig, StorageConfig, SyncConfig};
pub use edition::{
    Edition, EditionKey, EventSeries, FieldConflict, FieldSourceInfo, FieldSources, MergeAction,
};
pub use fields::{EditionFields, FieldMap, TrackedField};
pub use link::{Link, NewLink};
pub use registry::{ImportSummary, Registry};
pub use rules::{ExtractionConfig, FieldRule, RegexRule, RegexTemplate, RuleTemplate};
pub use run::{RunCounts, RunStatus, RunTrigger, SyncRun};
pub use snapshot::{ExtractionMeta, ExtractionMethod, NewSnapshot, RawSnapshot, SnapshotStatus};
pub use source::{FetchStrategy, MAX_INTERVAL_SECS, MAX_PRIORITY, Source, SourceType};
