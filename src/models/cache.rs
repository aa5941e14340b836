//! Cache index rows and statistics.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::RecordKind;

/// One row of `cache_index.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub url: String,
    pub kind: RecordKind,
    /// Body file path, relative to the storage root
    pub local_path: String,
    pub fetch_time: DateTime<Utc>,
    pub byte_size: u64,
    /// SHA-256 of the body, hex encoded
    pub checksum: String,
}

impl CacheEntry {
    /// Age of the entry in fractional hours at `now`.
    pub fn age_hours(&self, now: DateTime<Utc>) -> f64 {
        let age = now.signed_duration_since(self.fetch_time);
        age.num_milliseconds() as f64 / 3_600_000.0
    }

    /// Stale once the age strictly exceeds `max_age_hours`.
    pub fn is_stale_at(&self, max_age_hours: f64, now: DateTime<Utc>) -> bool {
        self.age_hours(now) > max_age_hours
    }
}

/// Aggregate cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entry_count: usize,
    pub total_bytes: u64,
    pub by_kind: BTreeMap<RecordKind, usize>,
    pub oldest_fetch: Option<DateTime<Utc>>,
    pub newest_fetch: Option<DateTime<Utc>>,
}

impl CacheStats {
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a CacheEntry>) -> Self {
        let mut stats = CacheStats::default();
        for entry in entries {
            stats.entry_count += 1;
            stats.total_bytes += entry.byte_size;
            *stats.by_kind.entry(entry.kind).or_default() += 1;
            stats.oldest_fetch = Some(match stats.oldest_fetch {
                Some(t) if t <= entry.fetch_time => t,
                _ => entry.fetch_time,
            });
            stats.newest_fetch = Some(match stats.newest_fetch {
                Some(t) if t >= entry.fetch_time => t,
                _ => entry.fetch_time,
            });
        }
        stats
    }
}
