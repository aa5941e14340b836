//! Local filesystem document cache.
//!
//! ## Write protocol
//!
//! 1. The body is written and synced to a unique temp file (in parallel across workers).
//! 2. Under the index lock, the new row is inserted and `cache_index.json` is
//!    rewritten (temp + sync + rename).
//! 3. The body temp file is renamed over the final path.
//!
//! If the process dies between steps 2 and 3, [`LocalCache::open`] finds the
//! finished temp body next to the missing file, verifies size and checksum, and
//! rolls it forward. Rows whose body cannot be recovered are dropped, so after
//! `open` every row points at an existing body of the recorded size.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{AppError, Result};
use crate::models::{CacheEntry, CacheStats, RecordKind};
use crate::storage::{CachedDocument, DocumentCache, EvictionPolicy, EvictionReport};
use crate::utils::checksum;

const INDEX_FILE: &str = "cache_index.json";
const BODY_DIR: &str = "bodies";

/// Index rows keyed by URL. Only mutated under the cache's lock.
#[derive(Debug, Default)]
struct CacheIndex {
    entries: BTreeMap<String, CacheEntry>,
}

impl CacheIndex {
    fn total_bytes(&self) -> u64 {
        self.entries.values().map(|e| e.byte_size).sum()
    }
}

/// Local filesystem cache backend.
pub struct LocalCache {
    root_dir: PathBuf,
    index: Mutex<CacheIndex>,
    policy: RwLock<EvictionPolicy>,
}

impl LocalCache {
    /// Open (or create) a cache rooted at `root_dir`, repairing the index.
    pub async fn open(root_dir: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_policy(root_dir, EvictionPolicy::default()).await
    }

    /// Open a cache with a size-bounded eviction policy.
    pub async fn open_with_policy(
        root_dir: impl Into<PathBuf>,
        policy: EvictionPolicy,
    ) -> Result<Self> {
        let root_dir = root_dir.into();
        let body_dir = root_dir.join(BODY_DIR);
        tokio::fs::create_dir_all(&body_dir)
            .await
            .map_err(|e| AppError::storage(&body_dir, e))?;

        let loaded = Self::read_index(&root_dir).await?;
        let (entries, repaired) = Self::recover(&root_dir, loaded).await?;

        let cache = Self {
            root_dir,
            index: Mutex::new(CacheIndex { entries }),
            policy: RwLock::new(policy),
        };

        if repaired {
            let index = cache.index.lock().await;
            cache.persist_index(&index).await?;
        }
        log::debug!(
            "Opened document cache at {:?} ({} entries)",
            cache.root_dir,
            cache.index.lock().await.entries.len()
        );
        Ok(cache)
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn policy(&self) -> EvictionPolicy {
        *self.policy.read()
    }

    /// Swap the eviction policy; later writes use the new one.
    pub fn set_policy(&self, policy: EvictionPolicy) {
        *self.policy.write() = policy;
    }

    /// Get the full path for a path relative to the root.
    fn path(&self, relative: &str) -> PathBuf {
        self.root_dir.join(relative)
    }

    fn body_key(url: &str) -> String {
        checksum(url.as_bytes())[..24].to_string()
    }

    fn body_relative_path(url: &str) -> String {
        format!("{}/{}.html", BODY_DIR, Self::body_key(url))
    }

    async fn read_index(root_dir: &Path) -> Result<Vec<CacheEntry>> {
        let path = root_dir.join(INDEX_FILE);
        match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<Vec<CacheEntry>>(&bytes) {
                Ok(entries) => Ok(entries),
                Err(e) => {
                    // Keep the unreadable file for inspection and start over
                    let quarantine = path.with_extension("json.corrupt");
                    log::warn!(
                        "Cache index {:?} is unreadable ({}); moving it to {:?}",
                        path,
                        e,
                        quarantine
                    );
                    tokio::fs::rename(&path, &quarantine)
                        .await
                        .map_err(|e| AppError::storage(&path, e))?;
                    Ok(Vec::new())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(AppError::storage(path, e)),
        }
    }

    /// Reconcile index rows with the files on disk.
    async fn recover(
        root_dir: &Path,
        loaded: Vec<CacheEntry>,
    ) -> Result<(BTreeMap<String, CacheEntry>, bool)> {
        let body_dir = root_dir.join(BODY_DIR);
        let mut temp_files: Vec<PathBuf> = Vec::new();
        let mut body_files: HashSet<PathBuf> = HashSet::new();

        let mut dir = tokio::fs::read_dir(&body_dir)
            .await
            .map_err(|e| AppError::storage(&body_dir, e))?;
        while let Some(item) = dir
            .next_entry()
            .await
            .map_err(|e| AppError::storage(&body_dir, e))?
        {
            let path = item.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some("tmp") => temp_files.push(path),
                _ => {
                    body_files.insert(path);
                }
            }
        }

        let mut repaired = false;
        let mut entries = BTreeMap::new();
        for entry in loaded {
            let body_path = root_dir.join(&entry.local_path);
            let size_ok = tokio::fs::metadata(&body_path)
                .await
                .map(|m| m.len() == entry.byte_size)
                .unwrap_or(false);

            if size_ok {
                entries.insert(entry.url.clone(), entry);
                continue;
            }

            if Self::roll_forward(&entry, &body_path, &temp_files).await {
                log::info!("Recovered interrupted cache write for {}", entry.url);
                body_files.insert(body_path);
                entries.insert(entry.url.clone(), entry);
            } else {
                log::warn!(
                    "Dropping cache entry for {}: body missing or size mismatch",
                    entry.url
                );
            }
            repaired = true;
        }

        for tmp in temp_files {
            if tokio::fs::metadata(&tmp).await.is_ok() {
                log::debug!("Removing orphan temp file {:?}", tmp);
                let _ = tokio::fs::remove_file(&tmp).await;
            }
        }

        let referenced: HashSet<PathBuf> = entries
            .values()
            .map(|e| root_dir.join(&e.local_path))
            .collect();
        for body in body_files.difference(&referenced) {
            log::debug!("Removing unreferenced body {:?}", body);
            let _ = tokio::fs::remove_file(body).await;
        }

        Ok((entries, repaired))
    }

    /// Move a finished temp body into place if it matches the row.
    async fn roll_forward(entry: &CacheEntry, body_path: &Path, temp_files: &[PathBuf]) -> bool {
        let Some(stem) = body_path.file_stem().and_then(|s| s.to_str()) else {
            return false;
        };
        let prefix = format!("{stem}.");

        for tmp in temp_files {
            let matches_name = tmp
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&prefix));
            if !matches_name {
                continue;
            }
            let Ok(bytes) = tokio::fs::read(tmp).await else {
                continue;
            };
            if bytes.len() as u64 == entry.byte_size && checksum(&bytes) == entry.checksum {
                return tokio::fs::rename(tmp, body_path).await.is_ok();
            }
        }
        false
    }

    /// Write bytes to `path` and sync them to disk.
    async fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
        let mut file = tokio::fs::File::create(path)
            .await
            .map_err(|e| AppError::storage(path, e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| AppError::storage(path, e))?;
        file.flush().await.map_err(|e| AppError::storage(path, e))?;
        file.sync_all()
            .await
            .map_err(|e| AppError::storage(path, e))?;
        Ok(())
    }

    /// Rewrite the index file atomically. Caller holds the lock.
    async fn persist_index(&self, index: &CacheIndex) -> Result<()> {
        let rows: Vec<&CacheEntry> = index.entries.values().collect();
        let bytes = serde_json::to_vec_pretty(&rows)?;
        let path = self.path(INDEX_FILE);
        let tmp = path.with_extension("json.tmp");
        Self::write_synced(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| AppError::storage(&path, e))?;
        Ok(())
    }

    /// Drop oldest rows until within budget. Caller holds the lock.
    async fn evict_locked(
        &self,
        index: &mut CacheIndex,
        max_bytes: u64,
        protect: Option<&str>,
    ) -> Result<EvictionReport> {
        let mut report = EvictionReport::default();
        let mut total = index.total_bytes();
        if total <= max_bytes {
            return Ok(report);
        }

        let mut candidates: Vec<(DateTime<Utc>, String)> = index
            .entries
            .values()
            .filter(|e| Some(e.url.as_str()) != protect)
            .map(|e| (e.fetch_time, e.url.clone()))
            .collect();
        candidates.sort();

        let mut removed = Vec::new();
        for (_, url) in candidates {
            if total <= max_bytes {
                break;
            }
            if let Some(entry) = index.entries.remove(&url) {
                total -= entry.byte_size;
                report.freed_bytes += entry.byte_size;
                report.evicted.push(url);
                removed.push(entry);
            }
        }

        // Index first, so no row ever points at a deleted body
        if let Err(e) = self.persist_index(index).await {
            for entry in removed {
                index.entries.insert(entry.url.clone(), entry);
            }
            return Err(e);
        }
        for entry in &removed {
            Self::remove_body(&self.path(&entry.local_path)).await;
        }

        log::info!(
            "Evicted {} cache entries ({} bytes) to fit budget of {} bytes",
            report.evicted.len(),
            report.freed_bytes,
            max_bytes
        );
        Ok(report)
    }

    async fn remove_body(path: &Path) {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to remove cached body {:?}: {}", path, e),
        }
    }
}

#[async_trait]
impl DocumentCache for LocalCache {
    async fn put(&self, url: &str, kind: RecordKind, bytes: &[u8]) -> Result<CacheEntry> {
        let local_path = Self::body_relative_path(url);
        let final_path = self.path(&local_path);
        let tmp_path = self.path(&format!(
            "{}/{}.{:016x}.tmp",
            BODY_DIR,
            Self::body_key(url),
            fastrand::u64(..)
        ));

        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AppError::storage(parent, e))?;
        }
        if let Err(e) = Self::write_synced(&tmp_path, bytes).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e);
        }

        let entry = CacheEntry {
            url: url.to_string(),
            kind,
            local_path,
            fetch_time: Utc::now(),
            byte_size: bytes.len() as u64,
            checksum: checksum(bytes),
        };

        let mut index = self.index.lock().await;
        let previous = index.entries.insert(url.to_string(), entry.clone());

        let committed = match self.persist_index(&index).await {
            Ok(()) => tokio::fs::rename(&tmp_path, &final_path)
                .await
                .map_err(|e| AppError::storage(&final_path, e)),
            Err(e) => Err(e),
        };

        if let Err(e) = committed {
            match previous {
                Some(prev) => index.entries.insert(url.to_string(), prev),
                None => index.entries.remove(url),
            };
            if let Err(restore) = self.persist_index(&index).await {
                log::error!("Failed to restore cache index after write error: {}", restore);
            }
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e);
        }

        log::debug!("Cached {} ({} bytes)", url, entry.byte_size);

        let policy = self.policy();
        if policy.on_write {
            if let Some(max_bytes) = policy.max_bytes {
                self.evict_locked(&mut index, max_bytes, Some(url)).await?;
            }
        }

        Ok(entry)
    }

    async fn get(&self, url: &str) -> Result<Option<CachedDocument>> {
        let index = self.index.lock().await;
        let Some(entry) = index.entries.get(url).cloned() else {
            return Ok(None);
        };

        let path = self.path(&entry.local_path);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("Cached body for {} is missing at {:?}", url, path);
                return Ok(None);
            }
            Err(e) => return Err(AppError::storage(path, e)),
        };
        drop(index);

        if checksum(&bytes) != entry.checksum {
            log::warn!("Checksum mismatch for cached {}; treating as miss", url);
            return Ok(None);
        }
        Ok(Some(CachedDocument { entry, bytes }))
    }

    async fn entry(&self, url: &str) -> Option<CacheEntry> {
        self.index.lock().await.entries.get(url).cloned()
    }

    async fn entries(&self, kind: RecordKind) -> Vec<CacheEntry> {
        let index = self.index.lock().await;
        let mut rows: Vec<CacheEntry> = index
            .entries
            .values()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect();
        rows.sort_by_key(|e| e.fetch_time);
        rows
    }

    async fn is_stale_at(&self, url: &str, max_age_hours: f64, now: DateTime<Utc>) -> bool {
        match self.index.lock().await.entries.get(url) {
            Some(entry) => entry.is_stale_at(max_age_hours, now),
            None => true,
        }
    }

    async fn stats(&self) -> CacheStats {
        let index = self.index.lock().await;
        CacheStats::from_entries(index.entries.values())
    }

    async fn evict_if_over_budget(&self, max_bytes: u64) -> Result<EvictionReport> {
        let mut index = self.index.lock().await;
        self.evict_locked(&mut index, max_bytes, None).await
    }

    async fn remove(&self, url: &str) -> Result<bool> {
        let mut index = self.index.lock().await;
        let Some(entry) = index.entries.remove(url) else {
            return Ok(false);
        };
        if let Err(e) = self.persist_index(&index).await {
            index.entries.insert(url.to_string(), entry);
            return Err(e);
        }
        Self::remove_body(&self.path(&entry.local_path)).await;
        Ok(true)
    }

    async fn clear(&self) -> Result<()> {
        let mut index = self.index.lock().await;
        let removed = std::mem::take(&mut index.entries);
        if let Err(e) = self.persist_index(&index).await {
            index.entries = removed;
            return Err(e);
        }
        for entry in removed.values() {
            Self::remove_body(&self.path(&entry.local_path)).await;
        }
        log::info!("Cleared {} cached documents", removed.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_and_get_round_trip() {
        let tmp = TempDir::new().unwrap();
        let cache = LocalCache::open(tmp.path()).await.unwrap();

        let before = cache.stats().await.entry_count;
        let entry = cache
            .put("https://example.com/genres", RecordKind::Genre, b"<html>hi</html>")
            .await
            .unwrap();
        assert_eq!(cache.stats().await.entry_count, before + 1);
        assert_eq!(entry.byte_size, 15);

        let doc = cache.get("https://example.com/genres").await.unwrap().unwrap();
        assert_eq!(doc.bytes, b"<html>hi</html>");
        assert_eq!(doc.entry.kind, RecordKind::Genre);
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let tmp = TempDir::new().unwrap();
        let cache = LocalCache::open(tmp.path()).await.unwrap();
        assert!(cache.get("https://nope.example").await.unwrap().is_none());
        assert!(cache.is_stale("https://nope.example", 24.0).await);
    }

    #[tokio::test]
    async fn test_replacing_entry_keeps_count() {
        let tmp = TempDir::new().unwrap();
        let cache = LocalCache::open(tmp.path()).await.unwrap();
        let url = "https://example.com/tags";

        cache.put(url, RecordKind::MetaTag, b"old").await.unwrap();
        cache.put(url, RecordKind::MetaTag, b"newer").await.unwrap();

        let stats = cache.stats().await;
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.total_bytes, 5);
        assert_eq!(cache.get(url).await.unwrap().unwrap().bytes, b"newer");
    }

    #[tokio::test]
    async fn test_staleness_follows_simulated_time() {
        let tmp = TempDir::new().unwrap();
        let cache = LocalCache::open(tmp.path()).await.unwrap();
        let url = "https://example.com/tips";
        let entry = cache.put(url, RecordKind::Technique, b"x").await.unwrap();

        assert!(!cache.is_stale(url, 24.0).await);
        assert!(!cache.is_stale_at(url, 24.0, entry.fetch_time + Duration::hours(23)).await);
        assert!(cache.is_stale_at(url, 24.0, entry.fetch_time + Duration::hours(25)).await);
    }

    #[tokio::test]
    async fn test_index_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let cache = LocalCache::open(tmp.path()).await.unwrap();
            cache
                .put("https://example.com/a", RecordKind::Genre, b"alpha")
                .await
                .unwrap();
        }
        let reopened = LocalCache::open(tmp.path()).await.unwrap();
        let doc = reopened.get("https://example.com/a").await.unwrap().unwrap();
        assert_eq!(doc.bytes, b"alpha");

        let raw = std::fs::read_to_string(tmp.path().join(INDEX_FILE)).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let row = &json.as_array().unwrap()[0];
        assert_eq!(row["url"], "https://example.com/a");
        assert_eq!(row["kind"], "genre");
        assert_eq!(row["byteSize"], 5);
        assert!(row["localPath"].as_str().unwrap().starts_with("bodies/"));
        assert!(row["fetchTime"].is_string());
    }

    #[tokio::test]
    async fn test_reopen_drops_rows_with_missing_bodies() {
        let tmp = TempDir::new().unwrap();
        let local_path = {
            let cache = LocalCache::open(tmp.path()).await.unwrap();
            cache
                .put("https://example.com/gone", RecordKind::Genre, b"body")
                .await
                .unwrap()
                .local_path
        };
        std::fs::remove_file(tmp.path().join(&local_path)).unwrap();

        let reopened = LocalCache::open(tmp.path()).await.unwrap();
        assert_eq!(reopened.stats().await.entry_count, 0);
    }

    #[tokio::test]
    async fn test_reopen_rolls_interrupted_write_forward() {
        let tmp = TempDir::new().unwrap();
        let url = "https://example.com/interrupted";
        let entry = {
            let cache = LocalCache::open(tmp.path()).await.unwrap();
            cache.put(url, RecordKind::Genre, b"payload").await.unwrap()
        };

        // Simulate a crash after the index write but before the body rename
        let body = tmp.path().join(&entry.local_path);
        let tmp_body = body.with_file_name(format!(
            "{}.00000000000000ff.tmp",
            body.file_stem().unwrap().to_str().unwrap()
        ));
        std::fs::rename(&body, &tmp_body).unwrap();

        let reopened = LocalCache::open(tmp.path()).await.unwrap();
        let doc = reopened.get(url).await.unwrap().unwrap();
        assert_eq!(doc.bytes, b"payload");
        assert!(!tmp_body.exists());
    }

    #[tokio::test]
    async fn test_reopen_removes_orphan_temp_files() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join(BODY_DIR)).unwrap();
        let orphan = tmp.path().join(BODY_DIR).join("deadbeef.0000000000000001.tmp");
        std::fs::write(&orphan, b"half written").unwrap();

        let cache = LocalCache::open(tmp.path()).await.unwrap();
        assert_eq!(cache.stats().await.entry_count, 0);
        assert!(!orphan.exists());
    }

    #[tokio::test]
    async fn test_corrupt_index_is_quarantined() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(INDEX_FILE), b"{not json").unwrap();

        let cache = LocalCache::open(tmp.path()).await.unwrap();
        assert_eq!(cache.stats().await.entry_count, 0);
        assert!(tmp.path().join("cache_index.json.corrupt").exists());
    }

    #[tokio::test]
    async fn test_evict_removes_oldest_first() {
        let tmp = TempDir::new().unwrap();
        let cache = LocalCache::open(tmp.path()).await.unwrap();

        cache.put("https://example.com/1", RecordKind::Genre, &[0u8; 10]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        cache.put("https://example.com/2", RecordKind::Genre, &[0u8; 10]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        cache.put("https://example.com/3", RecordKind::Genre, &[0u8; 10]).await.unwrap();

        let report = cache.evict_if_over_budget(20).await.unwrap();
        assert_eq!(report.evicted, vec!["https://example.com/1".to_string()]);
        assert_eq!(report.freed_bytes, 10);

        let stats = cache.stats().await;
        assert_eq!(stats.entry_count, 2);
        assert_eq!(stats.total_bytes, 20);
        assert!(cache.get("https://example.com/1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_evict_on_write_protects_new_entry() {
        let tmp = TempDir::new().unwrap();
        let policy = EvictionPolicy {
            max_bytes: Some(15),
            on_write: true,
        };
        let cache = LocalCache::open_with_policy(tmp.path(), policy).await.unwrap();

        cache.put("https://example.com/old", RecordKind::Genre, &[1u8; 10]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        cache.put("https://example.com/new", RecordKind::Genre, &[2u8; 10]).await.unwrap();

        assert!(cache.entry("https://example.com/old").await.is_none());
        assert!(cache.entry("https://example.com/new").await.is_some());
    }

    #[tokio::test]
    async fn test_policy_change_applies_to_next_write() {
        let tmp = TempDir::new().unwrap();
        let cache = LocalCache::open(tmp.path()).await.unwrap();
        cache.put("https://example.com/old", RecordKind::Genre, &[1u8; 10]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        cache.set_policy(EvictionPolicy {
            max_bytes: Some(15),
            on_write: true,
        });
        cache.put("https://example.com/new", RecordKind::Genre, &[2u8; 10]).await.unwrap();

        assert_eq!(cache.policy().max_bytes, Some(15));
        assert!(cache.entry("https://example.com/old").await.is_none());
        assert!(cache.entry("https://example.com/new").await.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_puts_do_not_corrupt_index() {
        let tmp = TempDir::new().unwrap();
        let cache = std::sync::Arc::new(LocalCache::open(tmp.path()).await.unwrap());

        let mut handles = Vec::new();
        for i in 0..16 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                let url = format!("https://example.com/{i}");
                cache.put(&url, RecordKind::MetaTag, url.as_bytes()).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let reopened = LocalCache::open(tmp.path()).await.unwrap();
        assert_eq!(reopened.stats().await.entry_count, 16);
        let doc = reopened.get("https://example.com/7").await.unwrap().unwrap();
        assert_eq!(doc.bytes, b"https://example.com/7");
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let tmp = TempDir::new().unwrap();
        let cache = LocalCache::open(tmp.path()).await.unwrap();
        cache.put("https://example.com/a", RecordKind::Genre, b"a").await.unwrap();
        cache.put("https://example.com/b", RecordKind::Technique, b"b").await.unwrap();

        assert!(cache.remove("https://example.com/a").await.unwrap());
        assert!(!cache.remove("https://example.com/a").await.unwrap());
        assert_eq!(cache.entries(RecordKind::Technique).await.len(), 1);

        cache.clear().await.unwrap();
        assert_eq!(cache.stats().await, CacheStats::default());
    }
}
