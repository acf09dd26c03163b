// src/lib.rs

//! Race edition sync engine.
//!
//! Crawls event pages on a schedule, archives changed content, extracts
//! race facts and merges them into one Edition per series and year, with
//! per-field provenance and deterministic conflict resolution.

pub mod error;
pub mod models;
pub mod pipeline;
pub mod services;
pub mod storage;
pub mod utils;
