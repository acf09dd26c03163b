//! Service layer for the sync engine.
//!
//! - Page fetching (`PageFetcher`, `HttpFetcher`)
//! - Structured extraction (`Extractor`)
//! - Field merging (`merge_fields`)
//! - Operator review (`ReviewQueue`)
//! - AI-drafted rule templates (`RuleGenerator`)

pub mod extractor;
pub mod fetcher;
pub mod merge;
pub mod review;
pub mod rule_generator;

pub use extractor::{Extraction, Extractor, normalize_date};
pub use fetcher::{FetchedPage, HttpFetcher, PageFetcher};
pub use merge::{FieldUpdate, MergeReason, MergeResult, Provenance, authority_rank, merge_fields};
pub use review::{Correction, ReviewQueue};
pub use rule_generator::{OpenAiRuleProvider, RuleGenerator, RuleProvider};
