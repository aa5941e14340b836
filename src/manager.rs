// src/manager.rs

//! Coordinator: the single entry point the rest of an application talks to.
//!
//! `DataManager` wires the cache, retry engine, fetcher and recovery layer
//! from the active config, serves resolved records from memory, and throws
//! both away when the config manager swaps in a config that affects them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::ConfigManager;
use crate::error::Result;
use crate::models::{
    CacheStats, Config, DomainRecord, ErrorEvent, HealthReport, RecordKind, ResolvedRecords,
    Severity, ValidationResult,
};
use crate::pipeline::recovery::builtin;
use crate::pipeline::{RecoveryLayer, RefreshResult, RetryEngine, run_refresh};
use crate::services::{ContentParser, ErrorMonitor, Fetcher};
use crate::storage::{DocumentCache, EvictionPolicy, LocalCache};
use crate::utils::http::{HttpSource, ReqwestSource};

const COMPONENT: &str = "manager";

/// Everything built from one config snapshot.
struct Components {
    generation: u64,
    config: Arc<Config>,
    /// Outlives generations as long as the storage path stays the same
    cache: Arc<LocalCache>,
    fetcher: Arc<Fetcher>,
    recovery: RecoveryLayer,
}

/// Coordinates fetching, caching, parsing and degradation.
pub struct DataManager {
    config: Arc<ConfigManager>,
    /// Replaces the reqwest source, mostly for tests
    http: Option<Arc<dyn HttpSource>>,
    monitor: Arc<ErrorMonitor>,
    /// Bumped on every config swap; components from older generations are rebuilt
    generation: AtomicU64,
    components: Mutex<Option<Arc<Components>>>,
    records: RwLock<HashMap<RecordKind, Arc<ResolvedRecords>>>,
    /// Bumped whenever `records` is invalidated
    records_epoch: AtomicU64,
}

impl DataManager {
    /// Build a manager over `config` that fetches with reqwest.
    pub fn new(config: Arc<ConfigManager>) -> Arc<Self> {
        Self::build(config, None)
    }

    /// Build a manager that fetches through `http`.
    pub fn with_http_source(config: Arc<ConfigManager>, http: Arc<dyn HttpSource>) -> Arc<Self> {
        Self::build(config, Some(http))
    }

    fn build(config: Arc<ConfigManager>, http: Option<Arc<dyn HttpSource>>) -> Arc<Self> {
        let monitor = Arc::new(ErrorMonitor::new(config.current().monitor.clone()));
        let manager = Arc::new(Self {
            config: Arc::clone(&config),
            http,
            monitor,
            generation: AtomicU64::new(0),
            components: Mutex::new(None),
            records: RwLock::new(HashMap::new()),
            records_epoch: AtomicU64::new(0),
        });

        let weak: Weak<Self> = Arc::downgrade(&manager);
        config.on_change(Arc::new(move |old: &Config, new: &Config| {
            if let Some(manager) = weak.upgrade() {
                manager.on_config_change(old, new);
            }
        }));
        manager
    }

    /// The active config.
    pub fn config(&self) -> Arc<Config> {
        self.config.current()
    }

    pub fn config_manager(&self) -> &Arc<ConfigManager> {
        &self.config
    }

    pub fn monitor(&self) -> &Arc<ErrorMonitor> {
        &self.monitor
    }

    /// Records of `kind`. Always answers, at worst with built-in data.
    pub async fn get_records(&self, kind: RecordKind) -> Vec<DomainRecord> {
        self.resolved(kind).await.records.clone()
    }

    /// Records of `kind` with their provenance and quality score.
    pub async fn resolved(&self, kind: RecordKind) -> Arc<ResolvedRecords> {
        if let Some(resolved) = self.records.read().get(&kind) {
            return Arc::clone(resolved);
        }

        let epoch = self.records_epoch.load(Ordering::SeqCst);
        let resolved = match self.components().await {
            Ok(components) if components.config.enabled => {
                components.recovery.resolve(kind).await
            }
            Ok(components) => components.recovery.resolve_offline(kind).await,
            Err(error) => {
                log::error!("Storage unavailable, serving built-in {kind} records: {error}");
                self.monitor.record(
                    ErrorEvent::new(Severity::Critical, COMPONENT, "get_records", error.to_string())
                        .with_error_kind(error.kind_label())
                        .recoverable(false),
                );
                builtin(
                    &self.config(),
                    kind,
                    vec![format!("storage unavailable: {error}")],
                )
            }
        };
        let resolved = Arc::new(resolved);

        // A result computed across an invalidation must not outlive it.
        let mut records = self.records.write();
        if self.records_epoch.load(Ordering::SeqCst) == epoch {
            records.insert(kind, Arc::clone(&resolved));
        }
        resolved
    }

    /// Run one refresh cycle. Without `force`, fresh cache entries are skipped.
    pub async fn refresh(&self, force: bool) -> RefreshResult {
        let components = match self.components().await {
            Ok(components) => components,
            Err(error) => {
                log::error!("Refresh aborted: {error}");
                self.monitor.record(
                    ErrorEvent::new(Severity::Critical, COMPONENT, "refresh", error.to_string())
                        .with_error_kind(error.kind_label())
                        .recoverable(false),
                );
                return RefreshResult {
                    success: false,
                    errors: vec![error.to_string()],
                    ..RefreshResult::default()
                };
            }
        };

        if !components.config.enabled {
            log::info!("Refresh skipped: live fetching is disabled");
            return RefreshResult {
                success: true,
                ..RefreshResult::default()
            };
        }

        let result = run_refresh(&components.fetcher, &components.config, force).await;
        if result.downloaded > 0 {
            self.invalidate_records();
        }
        if !result.success {
            self.monitor.record(
                ErrorEvent::new(
                    Severity::Warning,
                    COMPONENT,
                    "refresh",
                    format!("{} sources failed to refresh", result.failed),
                )
                .recoverable(true),
            );
        }
        result
    }

    /// Delete every cached document and forget resolved records.
    pub async fn clear_cache(&self) -> Result<()> {
        let components = self.components().await?;
        components.cache.clear().await?;
        self.invalidate_records();
        log::info!("Cache cleared");
        Ok(())
    }

    pub async fn cache_stats(&self) -> Result<CacheStats> {
        let components = self.components().await?;
        Ok(components.cache.stats().await)
    }

    pub fn health_status(&self) -> HealthReport {
        self.monitor.health_status()
    }

    /// Validate `config`, probing every source URL when `check_urls` is set.
    pub async fn validate_config(&self, config: &Config, check_urls: bool) -> ValidationResult {
        if !check_urls {
            return ConfigManager::validate(config);
        }
        match self.http_source(config) {
            Ok(source) => ConfigManager::validate_with_reachability(config, source.as_ref()).await,
            Err(error) => {
                let mut result = ConfigManager::validate(config);
                result.errors.push(format!("cannot build HTTP client: {error}"));
                result.valid = false;
                result
            }
        }
    }

    /// Refresh every `refreshIntervalHours` until the handle is aborted or
    /// the manager is dropped. The interval is re-read after each cycle.
    pub fn spawn_auto_refresh(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let interval = match weak.upgrade() {
                    Some(manager) => refresh_interval(&manager.config()),
                    None => return,
                };
                tokio::time::sleep(interval).await;

                let Some(manager) = weak.upgrade() else {
                    return;
                };
                let result = manager.refresh(false).await;
                log::info!(
                    "Scheduled refresh: {} downloaded, {} failed, {} skipped",
                    result.downloaded,
                    result.failed,
                    result.skipped
                );
            }
        })
    }

    /// Components for the current generation, rebuilt when outdated.
    async fn components(&self) -> Result<Arc<Components>> {
        let mut slot = self.components.lock().await;
        let generation = self.generation.load(Ordering::SeqCst);
        if let Some(components) = slot.as_ref() {
            if components.generation == generation {
                return Ok(Arc::clone(components));
            }
        }

        let config = self.config();
        let policy = EvictionPolicy {
            max_bytes: config.max_cache_bytes,
            on_write: config.evict_on_write,
        };
        // At most one open LocalCache per storage root.
        let cache = match slot.as_ref() {
            Some(previous) if previous.cache.root_dir() == config.local_storage_path.as_path() => {
                previous.cache.set_policy(policy);
                Arc::clone(&previous.cache)
            }
            _ => Arc::new(LocalCache::open_with_policy(&config.local_storage_path, policy).await?),
        };

        let retry = Arc::new(RetryEngine::from_config(&config).with_monitor(Arc::clone(&self.monitor)));
        let fetcher = Arc::new(
            Fetcher::new(
                self.http_source(&config)?,
                Arc::clone(&cache) as Arc<dyn DocumentCache>,
                retry,
                config.request_timeout(),
            )
            .with_monitor(Arc::clone(&self.monitor))
            .with_parser(ContentParser::new(config.section_indicators.clone())),
        );
        let recovery = RecoveryLayer::new(
            Arc::clone(&config),
            Arc::clone(&fetcher),
            Arc::clone(&self.monitor),
        );

        log::debug!(
            "Built pipeline components for config generation {} (storage {:?})",
            generation,
            config.local_storage_path
        );
        let components = Arc::new(Components {
            generation,
            config,
            cache,
            fetcher,
            recovery,
        });
        *slot = Some(Arc::clone(&components));
        Ok(components)
    }

    fn http_source(&self, config: &Config) -> Result<Arc<dyn HttpSource>> {
        match &self.http {
            Some(http) => Ok(Arc::clone(http)),
            None => Ok(Arc::new(ReqwestSource::from_config(config)?)),
        }
    }

    fn invalidate_records(&self) {
        let mut records = self.records.write();
        self.records_epoch.fetch_add(1, Ordering::SeqCst);
        records.clear();
    }

    fn on_config_change(&self, old: &Config, new: &Config) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if old.monitor != new.monitor {
            self.monitor.set_config(new.monitor.clone());
        }
        if old.log_level != new.log_level {
            log::set_max_level(crate::utils::log::level_from_str(&new.log_level));
        }
        if old.sources_changed(new) {
            log::info!("Sources changed, dropping resolved records");
            self.invalidate_records();
        }
    }
}

fn refresh_interval(config: &Config) -> Duration {
    Duration::try_from_secs_f64(config.refresh_interval_hours.max(1.0) * 3600.0)
        .unwrap_or(Duration::MAX)
}
