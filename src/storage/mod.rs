//! Storage abstractions for fetched source documents.
//!
//! Every successfully fetched page is kept as one body file plus one row in
//! a JSON index, so parsing can always fall back to the last good copy.
//!
//! ## Directory Structure
//!
//! ```text
//! {root}/
//! ├── cache_index.json      # Array of CacheEntry rows, rewritten wholesale
//! └── bodies/
//!     ├── 3f9a...c1.html    # One body per URL (name derived from the URL hash)
//!     └── 3f9a...c1.<n>.tmp # In-flight write, renamed into place last
//! ```

pub mod local;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{CacheEntry, CacheStats, RecordKind};

// Re-export for convenience
pub use local::LocalCache;

/// A cache hit: index row plus body bytes.
#[derive(Debug, Clone)]
pub struct CachedDocument {
    pub entry: CacheEntry,
    pub bytes: Vec<u8>,
}

/// Size-bounded eviction settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionPolicy {
    /// Total body bytes allowed; `None` disables eviction
    pub max_bytes: Option<u64>,
    /// Evict synchronously after every write
    pub on_write: bool,
}

/// What an eviction pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub evicted: Vec<String>,
    pub freed_bytes: u64,
}

/// Keyed, file-backed document cache.
#[async_trait]
pub trait DocumentCache: Send + Sync {
    /// Store `bytes` for `url`, replacing any previous body.
    async fn put(&self, url: &str, kind: RecordKind, bytes: &[u8]) -> Result<CacheEntry>;

    /// Load the entry and body for `url`.
    async fn get(&self, url: &str) -> Result<Option<CachedDocument>>;

    /// Index row for `url` without reading the body.
    async fn entry(&self, url: &str) -> Option<CacheEntry>;

    /// All rows of one kind, oldest first.
    async fn entries(&self, kind: RecordKind) -> Vec<CacheEntry>;

    /// True when `url` is missing or older than `max_age_hours` at `now`.
    async fn is_stale_at(&self, url: &str, max_age_hours: f64, now: DateTime<Utc>) -> bool;

    /// True when `url` is missing or older than `max_age_hours`.
    async fn is_stale(&self, url: &str, max_age_hours: f64) -> bool {
        self.is_stale_at(url, max_age_hours, Utc::now()).await
    }

    async fn stats(&self) -> CacheStats;

    /// Remove oldest entries until the total is within `max_bytes`.
    async fn evict_if_over_budget(&self, max_bytes: u64) -> Result<EvictionReport>;

    /// Drop one entry and its body. Returns whether it existed.
    async fn remove(&self, url: &str) -> Result<bool>;

    /// Drop every entry and body.
    async fn clear(&self) -> Result<()>;
}
