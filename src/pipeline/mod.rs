//! Sync pipeline.
//!
//! - `change`: content hashing for change detection
//! - `sync`: fetch, archive, extract and merge for one link
//! - `scheduler`: periodic passes, manual triggers and pass exclusion

pub mod change;
pub mod scheduler;
pub mod sync;

pub use change::content_hash;
pub use scheduler::{PassReport, Scheduler, SkipReason, SyncEngine};
pub use sync::{LinkSyncer, SnapshotOutcome};
