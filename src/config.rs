// src/config.rs

//! Configuration manager.
//!
//! Owns the active [`Config`], validates candidates before they become
//! active, hot-reloads the config file and notifies subscribers after every
//! successful swap. The active config is never mutated in place: a reload
//! replaces the whole `Arc<Config>`.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use sysinfo::Disks;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{AppError, Result};
use crate::models::{Config, StorageDiagnostics, UrlCheck, ValidationResult};
use crate::utils::http::HttpSource;
use crate::utils::url::validate_source_url;

/// Called with `(old, new)` after a validated config becomes active.
pub type ConfigListener = Arc<dyn Fn(&Config, &Config) + Send + Sync>;

/// Free space below this multiple of `minFreeSpaceBytes` is worth a warning.
const LOW_SPACE_FACTOR: u64 = 10;

/// What a reload did.
#[derive(Debug, Clone, PartialEq)]
pub enum ReloadOutcome {
    /// The candidate validated and replaced the active config
    Applied,
    /// The file content equals the active config
    Unchanged,
    /// The candidate failed to load or validate; the active config is kept
    Rejected(ValidationResult),
}

/// Loads, validates and hot-reloads the configuration.
pub struct ConfigManager {
    path: PathBuf,
    current: RwLock<Arc<Config>>,
    listeners: RwLock<Vec<ConfigListener>>,
    /// Serializes swaps so listeners see consecutive (old, new) pairs
    swap: Mutex<()>,
}

impl ConfigManager {
    /// Load a config file without validating it.
    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        Config::load(path)
    }

    /// Open `path` and make it the active config.
    ///
    /// Fails when the file cannot be read or does not validate.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = Self::load(&path)?;
        let validation = Self::validate(&config);
        for warning in &validation.warnings {
            log::warn!("Config {:?}: {}", path, warning);
        }
        if !validation.valid {
            return Err(AppError::validation(format!(
                "invalid config {:?}: {}",
                path,
                validation.error_summary()
            )));
        }
        log::info!("Loaded config from {:?}", path);
        Ok(Self::with_config(path, config))
    }

    /// Wrap an already validated `config` backed by `path`.
    pub fn with_config(path: impl Into<PathBuf>, config: Config) -> Self {
        Self {
            path: path.into(),
            current: RwLock::new(Arc::new(config)),
            listeners: RwLock::new(Vec::new()),
            swap: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The active config.
    pub fn current(&self) -> Arc<Config> {
        Arc::clone(&self.current.read())
    }

    /// Subscribe to config swaps.
    pub fn on_change(&self, listener: ConfigListener) {
        self.listeners.write().push(listener);
    }

    /// Range, URL-syntax and storage checks. No network access.
    pub fn validate(config: &Config) -> ValidationResult {
        let mut result = ValidationResult {
            errors: config.range_errors(),
            ..ValidationResult::default()
        };

        let sources = config.all_sources();
        if config.enabled && sources.is_empty() {
            result
                .warnings
                .push("no source URLs configured; only built-in data will be served".into());
        }

        let mut seen = HashSet::new();
        for (kind, url) in &sources {
            if !seen.insert(url.as_str()) {
                result
                    .warnings
                    .push(format!("duplicate source URL '{url}'"));
                continue;
            }
            let check = match validate_source_url(url) {
                Ok(_) => UrlCheck {
                    syntax_ok: true,
                    reachable: None,
                    status_code: None,
                    error: None,
                },
                Err(error) => {
                    result.errors.push(format!("{kind} source: {error}"));
                    UrlCheck {
                        syntax_ok: false,
                        reachable: None,
                        status_code: None,
                        error: Some(error.to_string()),
                    }
                }
            };
            result.url_accessibility.insert(url.clone(), check);
        }

        result.storage = check_storage(config, &mut result.errors, &mut result.warnings);
        result.valid = result.errors.is_empty();
        result
    }

    /// [`validate`](Self::validate) plus a GET against every syntactically valid URL.
    ///
    /// Unreachable sources are warnings: the pipeline degrades around them.
    pub async fn validate_with_reachability(
        config: &Config,
        source: &dyn HttpSource,
    ) -> ValidationResult {
        let mut result = Self::validate(config);
        let timeout = config.request_timeout();

        let targets: Vec<String> = result
            .url_accessibility
            .iter()
            .filter(|(_, check)| check.syntax_ok)
            .map(|(url, _)| url.clone())
            .collect();

        let checks: Vec<(String, std::result::Result<u16, String>)> = stream::iter(targets)
            .map(|url| async move {
                let outcome = match validate_source_url(&url) {
                    Ok(parsed) => source
                        .get(&parsed, timeout)
                        .await
                        .map(|response| response.status)
                        .map_err(|e| e.to_string()),
                    Err(e) => Err(e.to_string()),
                };
                (url, outcome)
            })
            .buffer_unordered(config.max_concurrent())
            .collect()
            .await;

        for (url, outcome) in checks {
            let Some(check) = result.url_accessibility.get_mut(&url) else {
                continue;
            };
            match outcome {
                Ok(status) => {
                    check.status_code = Some(status);
                    check.reachable = Some((200..300).contains(&status));
                    if !(200..300).contains(&status) {
                        result
                            .warnings
                            .push(format!("source '{url}' answered HTTP {status}"));
                    }
                }
                Err(error) => {
                    check.reachable = Some(false);
                    result
                        .warnings
                        .push(format!("source '{url}' unreachable: {error}"));
                    check.error = Some(error);
                }
            }
        }
        result
    }

    /// Re-read the config file and swap it in if it validates.
    pub fn reload(&self) -> ReloadOutcome {
        match Self::load(&self.path) {
            Ok(candidate) => self.apply(candidate),
            Err(error) => {
                log::warn!("Config reload from {:?} rejected: {}", self.path, error);
                ReloadOutcome::Rejected(ValidationResult {
                    valid: false,
                    errors: vec![error.to_string()],
                    ..ValidationResult::default()
                })
            }
        }
    }

    /// Merge `partial` (a JSON object of camelCase keys) over the active
    /// config, validate it and, when valid, persist it and make it active.
    pub fn update_settings(&self, partial: serde_json::Value) -> Result<ValidationResult> {
        let _guard = self.swap.lock();
        let current = self.current();

        let mut merged = serde_json::to_value(current.as_ref())?;
        merge_json(&mut merged, partial);
        let candidate: Config = match serde_json::from_value(merged) {
            Ok(config) => config,
            Err(error) => {
                return Ok(ValidationResult {
                    valid: false,
                    errors: vec![format!("invalid settings: {error}")],
                    ..ValidationResult::default()
                });
            }
        };

        let validation = Self::validate(&candidate);
        if !validation.valid {
            log::warn!("Settings update rejected: {}", validation.error_summary());
            return Ok(validation);
        }

        write_atomically(&self.path, &candidate.to_file_contents(&self.path)?)?;
        self.swap_locked(candidate);
        Ok(validation)
    }

    /// Validate `candidate` and make it active.
    fn apply(&self, candidate: Config) -> ReloadOutcome {
        let _guard = self.swap.lock();
        if *self.current() == candidate {
            return ReloadOutcome::Unchanged;
        }

        let validation = Self::validate(&candidate);
        if !validation.valid {
            log::warn!(
                "Config reload from {:?} rejected, keeping current config: {}",
                self.path,
                validation.error_summary()
            );
            return ReloadOutcome::Rejected(validation);
        }

        self.swap_locked(candidate);
        log::info!("Config reloaded from {:?}", self.path);
        ReloadOutcome::Applied
    }

    /// Caller holds `self.swap`.
    fn swap_locked(&self, candidate: Config) {
        let new = Arc::new(candidate);
        let old = std::mem::replace(&mut *self.current.write(), Arc::clone(&new));

        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener(&old, &new);
        }
    }

    /// Watch the config file and reload on change.
    ///
    /// Bursts of file events within `watchDebounceMillis` collapse into one
    /// reload. Watching stops when the returned handle is dropped.
    pub fn watch(self: &Arc<Self>) -> Result<ConfigWatch> {
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| AppError::config(format!("{:?} is not a file path", self.path)))?;
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        // The directory is watched so editors that replace the file are seen too.
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    if event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == Some(file_name.as_os_str()))
                    {
                        let _ = tx.send(());
                    }
                }
                Err(e) => log::error!("Config watcher error: {:?}", e),
            }
        })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        let debounce = Duration::from_millis(self.current().watch_debounce_millis);
        let task = tokio::spawn(debounce_loop(Arc::downgrade(self), rx, debounce));
        log::info!("Watching {:?} for changes", self.path);

        Ok(ConfigWatch {
            _watcher: watcher,
            task,
        })
    }
}

/// Live config watch; dropping it stops watching.
pub struct ConfigWatch {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl Drop for ConfigWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Single consumer of file events: wait for quiet, then reload once.
async fn debounce_loop(
    manager: Weak<ConfigManager>,
    mut events: mpsc::UnboundedReceiver<()>,
    debounce: Duration,
) {
    while events.recv().await.is_some() {
        loop {
            match tokio::time::timeout(debounce, events.recv()).await {
                Ok(Some(())) => continue,
                Ok(None) => return,
                Err(_) => break,
            }
        }

        let Some(manager) = manager.upgrade() else {
            return;
        };
        // Reload reads the file and runs subscriber callbacks synchronously.
        match tokio::task::spawn_blocking(move || manager.reload()).await {
            Ok(ReloadOutcome::Applied | ReloadOutcome::Unchanged) => {}
            Ok(ReloadOutcome::Rejected(validation)) => log::warn!(
                "Ignoring invalid config change: {}",
                validation.error_summary()
            ),
            Err(e) => log::error!("Config reload task failed: {}", e),
        }
    }
}

/// Recursively merge `patch` objects into `base`; other values replace.
fn merge_json(base: &mut serde_json::Value, patch: serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                match base.get_mut(&key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge_json(existing, value)
                    }
                    _ => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, patch) => *base = patch,
    }
}

/// Write `content` to a sibling temp file, sync it and rename over `path`.
fn write_atomically(path: &Path, content: &str) -> Result<()> {
    use std::io::Write;

    let tmp = path.with_extension(format!("{:016x}.tmp", fastrand::u64(..)));
    let write = || -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    };
    write().map_err(|e| {
        let _ = fs::remove_file(&tmp);
        AppError::storage(path, e)
    })
}

/// Existence, writability and free space of the storage root.
fn check_storage(
    config: &Config,
    errors: &mut Vec<String>,
    warnings: &mut Vec<String>,
) -> StorageDiagnostics {
    let path = config.local_storage_path.clone();
    let exists = path.is_dir();
    if path.exists() && !exists {
        errors.push(format!("storage path {path:?} is not a directory"));
    }

    // A missing root is created on first use; check its closest existing ancestor.
    let Some(check_dir) = path
        .ancestors()
        .map(|p| if p.as_os_str().is_empty() { Path::new(".") } else { p })
        .find(|p| p.is_dir())
        .map(Path::to_path_buf)
    else {
        errors.push(format!("storage path {path:?} has no existing ancestor"));
        return StorageDiagnostics {
            path,
            exists,
            ..StorageDiagnostics::default()
        };
    };

    let writable = is_writable(&check_dir);
    if !writable {
        errors.push(format!("storage path {path:?} is not writable"));
    }

    let free_bytes = free_space(&check_dir);
    match free_bytes {
        Some(free) if free < config.min_free_space_bytes => errors.push(format!(
            "only {free} bytes free under {path:?} (minimum {})",
            config.min_free_space_bytes
        )),
        Some(free) if free < config.min_free_space_bytes.saturating_mul(LOW_SPACE_FACTOR) => {
            warnings.push(format!("low free space under {path:?}: {free} bytes"))
        }
        Some(_) => {}
        None => warnings.push(format!("could not determine free space under {path:?}")),
    }

    StorageDiagnostics {
        path,
        exists,
        writable,
        free_bytes,
    }
}

fn is_writable(dir: &Path) -> bool {
    let marker = dir.join(format!(".write-check-{:016x}", fastrand::u64(..)));
    match fs::write(&marker, b"check") {
        Ok(()) => {
            let _ = fs::remove_file(&marker);
            true
        }
        Err(_) => false,
    }
}

/// Available bytes on the disk whose mount point holds `dir`.
fn free_space(dir: &Path) -> Option<u64> {
    let dir = dir.canonicalize().ok()?;
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| dir.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::http::testing::{ScriptedSource, Step};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("config.json");
        fs::write(&path, body).unwrap();
        path
    }

    fn valid_json(dir: &TempDir, hours: f64) -> String {
        serde_json::json!({
            "localStoragePath": dir.path().join("data"),
            "refreshIntervalHours": hours,
            "genrePages": ["https://example.com/genres"],
            "minFreeSpaceBytes": 0
        })
        .to_string()
    }

    fn counting_listener(manager: &ConfigManager) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        manager.on_change(Arc::new(move |_: &Config, _: &Config| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        count
    }

    #[test]
    fn test_open_rejects_invalid_file() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, r#"{"refreshIntervalHours": -1}"#);
        assert!(matches!(
            ConfigManager::open(&path),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_validate_reports_every_problem() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            local_storage_path: dir.path().to_path_buf(),
            refresh_interval_hours: 0.5,
            request_timeout: 0.0,
            max_retries: -1,
            genre_pages: vec!["ftp://example.com/x".into(), "https://example.com/a".into()],
            tip_pages: vec!["https://example.com/a".into()],
            min_free_space_bytes: 0,
            ..Config::default()
        };

        let result = ConfigManager::validate(&config);
        assert!(!result.valid);
        assert_eq!(result.errors.len(), 4, "{:?}", result.errors);
        assert!(result.warnings.iter().any(|w| w.contains("duplicate")));
        assert!(!result.url_accessibility["ftp://example.com/x"].syntax_ok);
        assert!(result.url_accessibility["https://example.com/a"].syntax_ok);
        assert!(result.storage.exists);
        assert!(result.storage.writable);
    }

    #[test]
    fn test_missing_storage_root_is_checked_through_ancestor() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            local_storage_path: dir.path().join("not/yet/created"),
            min_free_space_bytes: 0,
            ..Config::default()
        };
        let result = ConfigManager::validate(&config);
        assert!(result.valid, "{:?}", result.errors);
        assert!(!result.storage.exists);
        assert!(result.storage.writable);
    }

    #[test]
    fn test_invalid_reload_keeps_config_and_does_not_notify() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, &valid_json(&dir, 24.0));
        let manager = ConfigManager::open(&path).unwrap();
        let notified = counting_listener(&manager);

        fs::write(&path, r#"{"refreshIntervalHours": -1}"#).unwrap();
        assert!(matches!(manager.reload(), ReloadOutcome::Rejected(_)));
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(manager.reload(), ReloadOutcome::Rejected(_)));

        assert_eq!(manager.current().refresh_interval_hours, 24.0);
        assert_eq!(notified.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_valid_reload_notifies_once_with_old_and_new() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, &valid_json(&dir, 24.0));
        let manager = ConfigManager::open(&path).unwrap();

        let pairs = Arc::new(Mutex::new(Vec::new()));
        let sink = pairs.clone();
        manager.on_change(Arc::new(move |old: &Config, new: &Config| {
            sink.lock()
                .push((old.refresh_interval_hours, new.refresh_interval_hours));
        }));

        fs::write(&path, valid_json(&dir, 6.0)).unwrap();
        assert_eq!(manager.reload(), ReloadOutcome::Applied);
        assert_eq!(manager.reload(), ReloadOutcome::Unchanged);

        assert_eq!(*pairs.lock(), vec![(24.0, 6.0)]);
        assert_eq!(manager.current().refresh_interval_hours, 6.0);
    }

    #[test]
    fn test_update_settings_merges_and_persists() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, &valid_json(&dir, 24.0));
        let manager = ConfigManager::open(&path).unwrap();
        let notified = counting_listener(&manager);

        let rejected = manager
            .update_settings(serde_json::json!({ "maxRetries": -1 }))
            .unwrap();
        assert!(!rejected.valid);
        assert_eq!(manager.current().max_retries, 3);

        let accepted = manager
            .update_settings(serde_json::json!({
                "maxRetries": 5,
                "cacheQuality": { "floor": 0.2 }
            }))
            .unwrap();
        assert!(accepted.valid);
        assert_eq!(notified.load(Ordering::SeqCst), 1);

        let current = manager.current();
        assert_eq!(current.max_retries, 5);
        assert_eq!(current.cache_quality.floor, 0.2);
        assert_eq!(current.cache_quality.ceiling, 0.9);
        assert_eq!(current.genre_pages, vec!["https://example.com/genres"]);

        let on_disk = Config::load(&path).unwrap();
        assert_eq!(on_disk, *current);
    }

    #[tokio::test]
    async fn test_reachability_fills_accessibility_map() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            local_storage_path: dir.path().to_path_buf(),
            genre_pages: vec!["https://example.com/up".into()],
            tip_pages: vec!["https://example.com/down".into()],
            min_free_space_bytes: 0,
            ..Config::default()
        };
        let source = ScriptedSource::new();
        source.script("https://example.com/up", vec![Step::Ok("<p>ok</p>")]);
        source.script("https://example.com/down", vec![Step::Status(404)]);

        let result = ConfigManager::validate_with_reachability(&config, source.as_ref()).await;
        assert!(result.valid);
        assert_eq!(result.url_accessibility["https://example.com/up"].reachable, Some(true));
        let down = &result.url_accessibility["https://example.com/down"];
        assert_eq!(down.reachable, Some(false));
        assert_eq!(down.status_code, Some(404));
        assert_eq!(
            result
                .warnings
                .iter()
                .filter(|w| w.contains("https://example.com/"))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_watch_coalesces_bursts_into_one_reload() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, &valid_json(&dir, 24.0));
        let mut config = ConfigManager::load(&path).unwrap();
        config.watch_debounce_millis = 100;
        fs::write(&path, serde_json::to_string(&config).unwrap()).unwrap();

        let manager = Arc::new(ConfigManager::open(&path).unwrap());
        let notified = counting_listener(&manager);
        let _watch = manager.watch().unwrap();

        for hours in [12.0, 8.0, 6.0] {
            config.refresh_interval_hours = hours;
            fs::write(&path, serde_json::to_string(&config).unwrap()).unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mut waited = 0;
        while manager.current().refresh_interval_hours != 6.0 && waited < 50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            waited += 1;
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(manager.current().refresh_interval_hours, 6.0);
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_watched_reload_does_not_block_the_runtime() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, &valid_json(&dir, 24.0));
        let mut config = ConfigManager::load(&path).unwrap();
        config.watch_debounce_millis = 50;
        fs::write(&path, serde_json::to_string(&config).unwrap()).unwrap();

        let manager = Arc::new(ConfigManager::open(&path).unwrap());
        let busy = Arc::new(AtomicBool::new(false));
        let done = Arc::new(AtomicBool::new(false));
        let (in_listener, finished) = (busy.clone(), done.clone());
        manager.on_change(Arc::new(move |_: &Config, _: &Config| {
            in_listener.store(true, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(400));
            in_listener.store(false, Ordering::SeqCst);
            finished.store(true, Ordering::SeqCst);
        }));
        let _watch = manager.watch().unwrap();

        config.refresh_interval_hours = 12.0;
        fs::write(&path, serde_json::to_string(&config).unwrap()).unwrap();

        // This task shares the only worker thread with the debounce loop.
        let mut ticks_while_busy = 0;
        for _ in 0..500 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if busy.load(Ordering::SeqCst) {
                ticks_while_busy += 1;
            }
            if done.load(Ordering::SeqCst) {
                break;
            }
        }

        assert!(done.load(Ordering::SeqCst));
        assert!(ticks_while_busy >= 5, "only {ticks_while_busy} ticks during reload");
        assert_eq!(manager.current().refresh_interval_hours, 12.0);
    }
}
