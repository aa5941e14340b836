// src/pipeline/recovery.rs

//! Graceful degradation: live records, then cached records, then built-in ones.
//!
//! Each configured URL of a kind is resolved on its own. A URL resolves live
//! when its cached body is younger than `refreshIntervalHours` or a new fetch
//! parses into at least one record, cached when the most recent cached body
//! does (regardless of age), and fails otherwise. The kind
//! as a whole reports the worst tier any contributing URL needed and the mean
//! quality of those URLs; when no URL contributes anything the built-in
//! catalogue is served instead. `resolve` never fails.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};

use crate::error::AppError;
use crate::models::{
    CacheEntry, Config, DataSource, DomainRecord, ErrorEvent, RecordKind, ResolvedRecords,
    Severity,
};
use crate::services::{ContentParser, ErrorMonitor, Fetcher, fallback};
use crate::storage::DocumentCache;

const COMPONENT: &str = "recovery";

/// Live records always score 1.0; cached ones stay strictly below.
const LIVE_QUALITY: f64 = 1.0;
const MAX_CACHED_QUALITY: f64 = 0.99;

/// Records one URL contributed and the tier they came from.
struct UrlResolution {
    records: Vec<DomainRecord>,
    source: DataSource,
    quality: f64,
}

/// Chooses between live, cached and built-in records.
pub struct RecoveryLayer {
    config: Arc<Config>,
    fetcher: Arc<Fetcher>,
    cache: Arc<dyn DocumentCache>,
    parser: ContentParser,
    monitor: Arc<ErrorMonitor>,
}

impl RecoveryLayer {
    pub fn new(config: Arc<Config>, fetcher: Arc<Fetcher>, monitor: Arc<ErrorMonitor>) -> Self {
        let cache = Arc::clone(fetcher.cache());
        let parser = ContentParser::new(config.section_indicators.clone());
        Self {
            config,
            fetcher,
            cache,
            parser,
            monitor,
        }
    }

    /// Quality of records parsed from a cached document `entry`.
    pub fn cached_quality(&self, entry: &CacheEntry) -> f64 {
        let q = &self.config.cache_quality;
        let age = entry.age_hours(Utc::now());
        (q.ceiling - q.discount_per_hour * age)
            .max(q.floor)
            .clamp(0.0, MAX_CACHED_QUALITY)
    }

    /// Best available records of `kind`.
    pub async fn resolve(&self, kind: RecordKind) -> ResolvedRecords {
        let urls = self.config.urls_for(kind).to_vec();
        let mut warnings = Vec::new();
        if urls.is_empty() {
            warnings.push(format!("no {kind} sources configured"));
        }

        let resolutions: Vec<(String, Option<UrlResolution>, Vec<String>)> = stream::iter(urls)
            .map(|url| async move {
                let mut notes = Vec::new();
                let resolution = self.resolve_url(&url, kind, &mut notes).await;
                (url, resolution, notes)
            })
            .buffered(self.config.max_concurrent())
            .collect()
            .await;

        let mut records = Vec::new();
        let mut seen = HashSet::new();
        let mut tiers = Vec::new();
        for (url, resolution, notes) in resolutions {
            warnings.extend(notes);
            let Some(resolution) = resolution else {
                warnings.push(format!("{url}: no usable data"));
                continue;
            };
            tiers.push((resolution.source, resolution.quality));
            for record in resolution.records {
                if seen.insert(record.name().to_lowercase()) {
                    records.push(record);
                }
            }
        }

        if records.is_empty() {
            return self.fallback(kind, warnings);
        }

        let data_source = tiers
            .iter()
            .map(|(source, _)| *source)
            .max()
            .unwrap_or(DataSource::Live);
        let quality_score = tiers.iter().map(|(_, q)| q).sum::<f64>() / tiers.len() as f64;

        if data_source != DataSource::Live {
            self.report(
                Severity::Warning,
                kind,
                format!("serving {kind} records from {data_source} data (quality {quality_score:.2})"),
            );
        }
        log::info!(
            "Resolved {} {} records from {} data (quality {:.2})",
            records.len(),
            kind,
            data_source,
            quality_score
        );

        ResolvedRecords {
            kind,
            records,
            data_source,
            quality_score,
            resolved_at: Utc::now(),
            warnings,
        }
    }

    /// Cached-then-fallback resolution without any network access.
    pub async fn resolve_offline(&self, kind: RecordKind) -> ResolvedRecords {
        let mut warnings = vec!["live fetching disabled".to_string()];
        let mut records = Vec::new();
        let mut seen = HashSet::new();
        let mut qualities = Vec::new();

        for url in self.config.urls_for(kind) {
            if let Some(resolution) = self.resolve_cached(url, kind, &mut warnings).await {
                qualities.push(resolution.quality);
                for record in resolution.records {
                    if seen.insert(record.name().to_lowercase()) {
                        records.push(record);
                    }
                }
            }
        }

        if records.is_empty() {
            return self.fallback(kind, warnings);
        }

        ResolvedRecords {
            kind,
            records,
            data_source: DataSource::Cached,
            quality_score: qualities.iter().sum::<f64>() / qualities.len() as f64,
            resolved_at: Utc::now(),
            warnings,
        }
    }

    async fn resolve_url(
        &self,
        url: &str,
        kind: RecordKind,
        notes: &mut Vec<String>,
    ) -> Option<UrlResolution> {
        if let Some(resolution) = self.resolve_fresh(url, kind, notes).await {
            return Some(resolution);
        }

        let fetched = self.fetcher.fetch(url, kind).await;
        match fetched.bytes {
            Some(bytes) if fetched.success => {
                if let Some(records) = self.parse(&bytes, kind, url, notes) {
                    return Some(UrlResolution {
                        records,
                        source: DataSource::Live,
                        quality: LIVE_QUALITY,
                    });
                }
            }
            _ => notes.push(format!(
                "{url}: live fetch failed: {}",
                fetched.error.as_deref().unwrap_or("unknown error")
            )),
        }

        self.resolve_cached(url, kind, notes).await
    }

    /// Live-tier records from a cache entry the refresh cycle keeps current.
    async fn resolve_fresh(
        &self,
        url: &str,
        kind: RecordKind,
        notes: &mut Vec<String>,
    ) -> Option<UrlResolution> {
        if self.cache.is_stale(url, self.config.refresh_interval_hours).await {
            return None;
        }
        let document = match self.cache.get(url).await {
            Ok(document) => document?,
            Err(error) => {
                self.report_error(Severity::Error, kind, url, &error);
                return None;
            }
        };

        let records = self.parse(&document.bytes, kind, url, notes)?;
        log::debug!("Serving {} from cache fetched at {}", url, document.entry.fetch_time);
        Some(UrlResolution {
            records,
            source: DataSource::Live,
            quality: LIVE_QUALITY,
        })
    }

    async fn resolve_cached(
        &self,
        url: &str,
        kind: RecordKind,
        notes: &mut Vec<String>,
    ) -> Option<UrlResolution> {
        let document = match self.cache.get(url).await {
            Ok(Some(document)) => document,
            Ok(None) => {
                notes.push(format!("{url}: nothing cached"));
                return None;
            }
            Err(error) => {
                self.report_error(Severity::Error, kind, url, &error);
                notes.push(format!("{url}: cache read failed: {error}"));
                return None;
            }
        };

        let records = self.parse(&document.bytes, kind, url, notes)?;
        Some(UrlResolution {
            records,
            source: DataSource::Cached,
            quality: self.cached_quality(&document.entry),
        })
    }

    /// Parsed records, or `None` when the body yields nothing usable.
    fn parse(
        &self,
        bytes: &[u8],
        kind: RecordKind,
        url: &str,
        notes: &mut Vec<String>,
    ) -> Option<Vec<DomainRecord>> {
        match self.parser.parse(bytes, kind, url) {
            Ok(outcome) => {
                for error in &outcome.errors {
                    self.monitor.record(
                        ErrorEvent::new(Severity::Warning, "parser", kind.as_str(), error.clone())
                            .with_context(url)
                            .with_error_kind("parse")
                            .recoverable(true),
                    );
                }
                notes.extend(outcome.warnings.into_iter().map(|w| format!("{url}: {w}")));
                if outcome.records.is_empty() {
                    None
                } else {
                    Some(outcome.records)
                }
            }
            Err(error) => {
                self.report_error(Severity::Error, kind, url, &error);
                notes.push(format!("{url}: {error}"));
                None
            }
        }
    }

    fn fallback(&self, kind: RecordKind, warnings: Vec<String>) -> ResolvedRecords {
        if self.config.fallback_enabled {
            self.report(
                Severity::Error,
                kind,
                format!("no live or cached {kind} data, serving built-in records"),
            );
        } else {
            self.report(
                Severity::Critical,
                kind,
                format!("no {kind} data available and fallback is disabled"),
            );
        }
        builtin(&self.config, kind, warnings)
    }

    fn report(&self, severity: Severity, kind: RecordKind, message: String) {
        self.monitor.record(
            ErrorEvent::new(severity, COMPONENT, kind.as_str(), message)
                .recoverable(severity < Severity::Critical),
        );
    }

    fn report_error(&self, severity: Severity, kind: RecordKind, url: &str, error: &AppError) {
        self.monitor.record(
            ErrorEvent::new(severity, COMPONENT, kind.as_str(), error.to_string())
                .with_context(url)
                .with_error_kind(error.kind_label())
                .recoverable(true),
        );
    }
}

/// The built-in tier on its own: catalogue records at `fallbackQuality`, or
/// nothing at all when `fallbackEnabled` is off.
pub fn builtin(config: &Config, kind: RecordKind, mut warnings: Vec<String>) -> ResolvedRecords {
    let (records, quality_score) = if config.fallback_enabled {
        (fallback::records(kind), config.fallback_quality)
    } else {
        warnings.push("fallback disabled".to_string());
        (Vec::new(), 0.0)
    };

    ResolvedRecords {
        kind,
        records,
        data_source: DataSource::Fallback,
        quality_score,
        resolved_at: Utc::now(),
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{CircuitBreakerConfig, RetryEngine, RetryPolicy};
    use crate::storage::LocalCache;
    use crate::utils::http::testing::{ScriptedSource, Step};
    use std::time::Duration;
    use tempfile::TempDir;

    const GENRES_URL: &str = "https://example.com/genres";
    const PAGE: &str = "<body><h2>Electronic</h2><ul><li>Ambient (atmospheric and textural music)</li></ul></body>";
    const OTHER_PAGE: &str = "<body><h2>Rock</h2><ul><li>Grunge (heavy, sludgy guitars)</li></ul></body>";

    struct Harness {
        _dir: TempDir,
        source: Arc<ScriptedSource>,
        cache: Arc<LocalCache>,
        layer: RecoveryLayer,
    }

    async fn harness(config: Config) -> Harness {
        harness_in(TempDir::new().unwrap(), config).await
    }

    /// A storage dir holding `pages`, every entry fetched `hours_old` ago.
    async fn aged_cache(pages: &[(&str, &str)], hours_old: i64) -> TempDir {
        let dir = TempDir::new().unwrap();
        let cache = LocalCache::open(dir.path()).await.unwrap();
        for (url, page) in pages {
            cache.put(url, RecordKind::Genre, page.as_bytes()).await.unwrap();
        }
        drop(cache);

        let index = dir.path().join("cache_index.json");
        let mut rows: Vec<CacheEntry> =
            serde_json::from_slice(&std::fs::read(&index).unwrap()).unwrap();
        for row in &mut rows {
            row.fetch_time = Utc::now() - chrono::Duration::hours(hours_old);
        }
        std::fs::write(&index, serde_json::to_vec(&rows).unwrap()).unwrap();
        dir
    }

    async fn harness_in(dir: TempDir, config: Config) -> Harness {
        let cache = Arc::new(LocalCache::open(dir.path()).await.unwrap());
        let source = ScriptedSource::new();
        let monitor = Arc::new(ErrorMonitor::default());
        let retry = Arc::new(
            RetryEngine::new(
                RetryPolicy {
                    max_attempts: 2,
                    base_delay: Duration::from_millis(5),
                    max_delay: Duration::from_millis(10),
                    jitter: false,
                },
                CircuitBreakerConfig::default(),
            )
            .with_monitor(monitor.clone()),
        );
        let fetcher = Arc::new(
            Fetcher::new(source.clone(), cache.clone(), retry, Duration::from_secs(1))
                .with_monitor(monitor.clone())
                .with_parser(ContentParser::new(config.section_indicators.clone())),
        );
        let layer = RecoveryLayer::new(Arc::new(config), fetcher, monitor);
        Harness {
            _dir: dir,
            source,
            cache,
            layer,
        }
    }

    fn config_with_genres() -> Config {
        Config {
            genre_pages: vec![GENRES_URL.to_string()],
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_reachable_source_is_live() {
        let h = harness(config_with_genres()).await;
        h.source.script(GENRES_URL, vec![Step::Ok(PAGE)]);

        let resolved = h.layer.resolve(RecordKind::Genre).await;
        assert_eq!(resolved.data_source, DataSource::Live);
        assert_eq!(resolved.quality_score, 1.0);
        assert_eq!(resolved.records[0].name(), "Ambient");
    }

    #[tokio::test]
    async fn test_unreachable_source_with_cache_is_cached() {
        let dir = aged_cache(&[(GENRES_URL, PAGE)], 48).await;
        let h = harness_in(dir, config_with_genres()).await;
        h.source.script(GENRES_URL, vec![Step::Status(503)]);

        let resolved = h.layer.resolve(RecordKind::Genre).await;
        assert_eq!(resolved.data_source, DataSource::Cached);
        assert!(resolved.quality_score < 1.0);
        assert!(resolved.quality_score > 0.0);
        assert_eq!(resolved.records[0].name(), "Ambient");
        assert_eq!(h.source.calls(GENRES_URL), 1);
    }

    #[tokio::test]
    async fn test_fresh_cache_is_live_without_fetching() {
        let h = harness(config_with_genres()).await;
        h.cache.put(GENRES_URL, RecordKind::Genre, PAGE.as_bytes()).await.unwrap();
        h.source.script(GENRES_URL, vec![Step::Status(503)]);

        let resolved = h.layer.resolve(RecordKind::Genre).await;
        assert_eq!(resolved.data_source, DataSource::Live);
        assert_eq!(resolved.quality_score, 1.0);
        assert_eq!(resolved.records[0].name(), "Ambient");
        assert_eq!(h.source.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_nothing_available_is_fallback() {
        let h = harness(config_with_genres()).await;
        h.source.script(GENRES_URL, vec![Step::Status(404)]);

        let resolved = h.layer.resolve(RecordKind::Genre).await;
        assert_eq!(resolved.data_source, DataSource::Fallback);
        assert!(!resolved.records.is_empty());
        assert!((resolved.quality_score - 0.1).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_unparseable_live_page_uses_cache() {
        let dir = aged_cache(&[(GENRES_URL, PAGE)], 48).await;
        let h = harness_in(dir, config_with_genres()).await;
        h.source.script(GENRES_URL, vec![Step::Ok("<body><p>maintenance</p></body>")]);

        let resolved = h.layer.resolve(RecordKind::Genre).await;
        assert_eq!(resolved.data_source, DataSource::Cached);
        assert_eq!(resolved.records[0].name(), "Ambient");
        assert!(resolved.warnings.iter().any(|w| w.contains("no genre sections")));

        // The good copy survives, so the next call degrades the same way.
        let doc = h.cache.get(GENRES_URL).await.unwrap().unwrap();
        assert_eq!(doc.bytes, PAGE.as_bytes());
        let again = h.layer.resolve(RecordKind::Genre).await;
        assert_eq!(again.data_source, DataSource::Cached);
    }

    #[tokio::test]
    async fn test_unparseable_live_page_without_cache_is_fallback() {
        let h = harness(config_with_genres()).await;
        h.source.script(GENRES_URL, vec![Step::Ok("<body><p>maintenance</p></body>")]);

        let resolved = h.layer.resolve(RecordKind::Genre).await;
        assert_eq!(resolved.data_source, DataSource::Fallback);
        assert!(h.cache.entry(GENRES_URL).await.is_none());
    }

    #[tokio::test]
    async fn test_mixed_tiers_report_worst() {
        let second = "https://example.com/more-genres";
        let config = Config {
            genre_pages: vec![GENRES_URL.to_string(), second.to_string()],
            ..Config::default()
        };
        let h = harness_in(aged_cache(&[(second, OTHER_PAGE)], 48).await, config).await;
        h.source.script(GENRES_URL, vec![Step::Ok(PAGE)]);
        h.source.script(second, vec![Step::Status(500)]);

        let resolved = h.layer.resolve(RecordKind::Genre).await;
        assert_eq!(resolved.data_source, DataSource::Cached);
        let names: Vec<&str> = resolved.records.iter().map(|r| r.name()).collect();
        assert_eq!(names, vec!["Ambient", "Grunge"]);
        // mean of live 1.0 and a two-day-old copy at 0.42
        assert!((resolved.quality_score - 0.71).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_fallback_disabled_returns_empty() {
        let config = Config {
            fallback_enabled: false,
            ..config_with_genres()
        };
        let h = harness(config).await;
        h.source.script(GENRES_URL, vec![Step::Status(404)]);

        let resolved = h.layer.resolve(RecordKind::Genre).await;
        assert_eq!(resolved.data_source, DataSource::Fallback);
        assert!(resolved.records.is_empty());
        assert_eq!(resolved.quality_score, 0.0);
    }

    #[tokio::test]
    async fn test_offline_never_touches_network() {
        let h = harness(config_with_genres()).await;
        h.cache.put(GENRES_URL, RecordKind::Genre, PAGE.as_bytes()).await.unwrap();

        let resolved = h.layer.resolve_offline(RecordKind::Genre).await;
        assert_eq!(resolved.data_source, DataSource::Cached);
        assert_eq!(h.source.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_cached_quality_decays_to_floor() {
        let h = harness(config_with_genres()).await;
        let mut entry = h.cache.put(GENRES_URL, RecordKind::Genre, PAGE.as_bytes()).await.unwrap();
        let fresh = h.layer.cached_quality(&entry);
        assert!(fresh < 1.0 && fresh > 0.85);

        entry.fetch_time = Utc::now() - chrono::Duration::hours(10);
        let older = h.layer.cached_quality(&entry);
        assert!(older < fresh);

        entry.fetch_time = Utc::now() - chrono::Duration::days(365);
        assert!((h.layer.cached_quality(&entry) - 0.3).abs() < 1e-9);
    }
}
