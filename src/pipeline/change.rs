// src/pipeline/change.rs

//! Content-hash change detection.

use sha2::{Digest, Sha256};

/// Hex SHA-256 of a fetched body.
pub fn content_hash(body: &str) -> String {
    hex::encode(Sha256::digest(body.as_bytes()))
}

/// Whether `hash` differs from the last stored one.
pub fn has_changed(last_hash: Option<&str>, hash: &str) -> bool {
    last_hash != Some(hash)
}
