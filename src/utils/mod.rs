//! Utility functions and helpers.

pub mod http;
pub mod log;
pub mod url;

use sha2::{Digest, Sha256};

/// SHA-256 of `bytes`, hex encoded.
pub fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Collapse runs of whitespace into single spaces and trim.
pub fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
