//! Application configuration structures.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::RecordKind;

/// Root configuration object.
///
/// Loaded from JSON (or TOML, by extension). Unknown keys are ignored and
/// missing keys take the defaults in [`defaults`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,

    /// Root directory for the document cache
    #[serde(default = "defaults::local_storage_path")]
    pub local_storage_path: PathBuf,

    #[serde(default = "defaults::refresh_interval_hours")]
    pub refresh_interval_hours: f64,

    /// Per-request timeout in seconds
    #[serde(default = "defaults::request_timeout")]
    pub request_timeout: f64,

    #[serde(default = "defaults::max_retries")]
    pub max_retries: i64,

    /// Base retry delay in seconds
    #[serde(default = "defaults::retry_delay")]
    pub retry_delay: f64,

    /// Upper bound for a single backoff delay in seconds
    #[serde(default = "defaults::max_retry_delay")]
    pub max_retry_delay: f64,

    #[serde(default = "defaults::max_concurrent_fetches")]
    pub max_concurrent_fetches: i64,

    #[serde(default = "defaults::fallback_enabled")]
    pub fallback_enabled: bool,

    #[serde(default)]
    pub genre_pages: Vec<String>,

    #[serde(default)]
    pub meta_tag_pages: Vec<String>,

    #[serde(default)]
    pub tip_pages: Vec<String>,

    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,

    #[serde(default = "defaults::log_level")]
    pub log_level: String,

    #[serde(default = "defaults::circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,

    #[serde(default = "defaults::circuit_open_seconds")]
    pub circuit_open_seconds: f64,

    /// Overall deadline for a batch fetch in seconds
    #[serde(default)]
    pub batch_deadline_seconds: Option<f64>,

    /// Cache size ceiling; eviction is disabled when absent
    #[serde(default)]
    pub max_cache_bytes: Option<u64>,

    #[serde(default = "defaults::evict_on_write")]
    pub evict_on_write: bool,

    #[serde(default = "defaults::min_free_space_bytes")]
    pub min_free_space_bytes: u64,

    #[serde(default = "defaults::watch_debounce_millis")]
    pub watch_debounce_millis: u64,

    #[serde(default)]
    pub cache_quality: CacheQualityConfig,

    #[serde(default = "defaults::fallback_quality")]
    pub fallback_quality: f64,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub section_indicators: SectionIndicators,
}

impl Config {
    /// Load configuration from a JSON or TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        Self::parse(&content, is_toml(path))
    }

    /// Parse configuration text.
    pub fn parse(content: &str, toml_format: bool) -> Result<Self> {
        if toml_format {
            Ok(toml::from_str(content)?)
        } else {
            Ok(serde_json::from_str(content)?)
        }
    }

    /// Load configuration or return default if loading fails.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(&path).unwrap_or_else(|e| {
            log::warn!(
                "Config load failed from {:?}: {}. Using defaults.",
                path.as_ref(),
                e
            );
            Self::default()
        })
    }

    /// Serialize in the format implied by `path`.
    pub fn to_file_contents(&self, path: &Path) -> Result<String> {
        if is_toml(path) {
            toml::to_string_pretty(self).map_err(|e| AppError::config(e.to_string()))
        } else {
            Ok(serde_json::to_string_pretty(self)?)
        }
    }

    /// Numeric range checks. Returns every violation, not just the first.
    pub fn range_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if !(self.refresh_interval_hours >= 1.0) {
            errors.push(format!(
                "refreshIntervalHours must be >= 1 (got {})",
                self.refresh_interval_hours
            ));
        }
        if !(self.request_timeout >= 1.0) {
            errors.push(format!(
                "requestTimeout must be >= 1 second (got {})",
                self.request_timeout
            ));
        }
        if self.max_retries < 0 {
            errors.push(format!("maxRetries must be >= 0 (got {})", self.max_retries));
        }
        if !(self.retry_delay >= 0.0) {
            errors.push(format!("retryDelay must be >= 0 (got {})", self.retry_delay));
        }
        if !(self.max_retry_delay >= self.retry_delay) {
            errors.push("maxRetryDelay must be >= retryDelay".to_string());
        }
        if self.max_concurrent_fetches < 1 {
            errors.push(format!(
                "maxConcurrentFetches must be >= 1 (got {})",
                self.max_concurrent_fetches
            ));
        }
        if self.circuit_failure_threshold == 0 {
            errors.push("circuitFailureThreshold must be > 0".to_string());
        }
        if !(self.circuit_open_seconds >= 0.0) {
            errors.push("circuitOpenSeconds must be >= 0".to_string());
        }
        if let Some(deadline) = self.batch_deadline_seconds {
            if !(deadline > 0.0) {
                errors.push("batchDeadlineSeconds must be > 0".to_string());
            }
        }
        if self.user_agent.trim().is_empty() {
            errors.push("userAgent is empty".to_string());
        }
        for (name, value) in [
            ("cacheQuality.ceiling", self.cache_quality.ceiling),
            ("cacheQuality.floor", self.cache_quality.floor),
            ("fallbackQuality", self.fallback_quality),
        ] {
            if !(0.0..=1.0).contains(&value) {
                errors.push(format!("{name} must be within [0, 1] (got {value})"));
            }
        }
        if self.cache_quality.floor > self.cache_quality.ceiling {
            errors.push("cacheQuality.floor must not exceed cacheQuality.ceiling".to_string());
        }
        if !(self.cache_quality.discount_per_hour >= 0.0) {
            errors.push("cacheQuality.discountPerHour must be >= 0".to_string());
        }
        if self.monitor.history_capacity == 0 {
            errors.push("monitor.historyCapacity must be > 0".to_string());
        }
        if self.monitor.alert_threshold == 0 {
            errors.push("monitor.alertThreshold must be > 0".to_string());
        }
        errors
    }

    /// Source URLs configured for a record kind.
    pub fn urls_for(&self, kind: RecordKind) -> &[String] {
        match kind {
            RecordKind::Genre => &self.genre_pages,
            RecordKind::MetaTag => &self.meta_tag_pages,
            RecordKind::Technique => &self.tip_pages,
        }
    }

    /// Every configured source paired with its kind.
    pub fn all_sources(&self) -> Vec<(RecordKind, String)> {
        RecordKind::ALL
            .iter()
            .flat_map(|kind| self.urls_for(*kind).iter().map(|u| (*kind, u.clone())))
            .collect()
    }

    /// True when the two configs differ in anything that invalidates parsed records.
    pub fn sources_changed(&self, other: &Config) -> bool {
        self.local_storage_path != other.local_storage_path
            || self.genre_pages != other.genre_pages
            || self.meta_tag_pages != other.meta_tag_pages
            || self.tip_pages != other.tip_pages
            || self.section_indicators != other.section_indicators
            || self.enabled != other.enabled
            || self.fallback_enabled != other.fallback_enabled
    }

    pub fn request_timeout(&self) -> Duration {
        seconds(self.request_timeout)
    }

    pub fn retry_delay(&self) -> Duration {
        seconds(self.retry_delay)
    }

    pub fn max_retry_delay(&self) -> Duration {
        seconds(self.max_retry_delay)
    }

    pub fn circuit_open_duration(&self) -> Duration {
        seconds(self.circuit_open_seconds)
    }

    pub fn batch_deadline(&self) -> Option<Duration> {
        self.batch_deadline_seconds
            .filter(|s| *s > 0.0)
            .map(seconds)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent_fetches.max(1) as usize
    }

    /// Total attempts per fetch (first try plus retries).
    pub fn max_attempts(&self) -> u32 {
        (self.max_retries.clamp(0, 100) as u32) + 1
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: defaults::enabled(),
            local_storage_path: defaults::local_storage_path(),
            refresh_interval_hours: defaults::refresh_interval_hours(),
            request_timeout: defaults::request_timeout(),
            max_retries: defaults::max_retries(),
            retry_delay: defaults::retry_delay(),
            max_retry_delay: defaults::max_retry_delay(),
            max_concurrent_fetches: defaults::max_concurrent_fetches(),
            fallback_enabled: defaults::fallback_enabled(),
            genre_pages: Vec::new(),
            meta_tag_pages: Vec::new(),
            tip_pages: Vec::new(),
            user_agent: defaults::user_agent(),
            log_level: defaults::log_level(),
            circuit_failure_threshold: defaults::circuit_failure_threshold(),
            circuit_open_seconds: defaults::circuit_open_seconds(),
            batch_deadline_seconds: None,
            max_cache_bytes: None,
            evict_on_write: defaults::evict_on_write(),
            min_free_space_bytes: defaults::min_free_space_bytes(),
            watch_debounce_millis: defaults::watch_debounce_millis(),
            cache_quality: CacheQualityConfig::default(),
            fallback_quality: defaults::fallback_quality(),
            monitor: MonitorConfig::default(),
            section_indicators: SectionIndicators::default(),
        }
    }
}

/// Seconds to a `Duration`, saturating instead of panicking on odd values.
fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::MAX)
}

fn is_toml(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("toml"))
}

/// Quality scoring for records served from a cached document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheQualityConfig {
    /// Score of a cached document of age zero
    #[serde(default = "defaults::cache_quality_ceiling")]
    pub ceiling: f64,

    /// Score lost per hour of age
    #[serde(default = "defaults::cache_quality_discount")]
    pub discount_per_hour: f64,

    /// Lowest score a cached document can get
    #[serde(default = "defaults::cache_quality_floor")]
    pub floor: f64,
}

impl Default for CacheQualityConfig {
    fn default() -> Self {
        Self {
            ceiling: defaults::cache_quality_ceiling(),
            discount_per_hour: defaults::cache_quality_discount(),
            floor: defaults::cache_quality_floor(),
        }
    }
}

/// Error monitor thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorConfig {
    #[serde(default = "defaults::monitor_window")]
    pub window_seconds: u64,

    /// Events of one (component, severity) within the window that raise an alert
    #[serde(default = "defaults::alert_threshold")]
    pub alert_threshold: usize,

    /// Events kept per component
    #[serde(default = "defaults::history_capacity")]
    pub history_capacity: usize,

    /// Error-or-worse events within the window that mean "degraded"
    #[serde(default = "defaults::degraded_error_count")]
    pub degraded_error_count: usize,

    /// Warning-or-worse events within the window that mean "warning"
    #[serde(default = "defaults::warning_event_count")]
    pub warning_event_count: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window_seconds: defaults::monitor_window(),
            alert_threshold: defaults::alert_threshold(),
            history_capacity: defaults::history_capacity(),
            degraded_error_count: defaults::degraded_error_count(),
            warning_event_count: defaults::warning_event_count(),
        }
    }
}

/// Heading keywords that mark content sections, per record kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionIndicators {
    #[serde(default = "defaults::genre_indicators")]
    pub genre: Vec<String>,

    #[serde(default = "defaults::meta_tag_indicators")]
    pub meta_tag: Vec<String>,

    #[serde(default = "defaults::technique_indicators")]
    pub technique: Vec<String>,
}

impl SectionIndicators {
    pub fn for_kind(&self, kind: RecordKind) -> &[String] {
        match kind {
            RecordKind::Genre => &self.genre,
            RecordKind::MetaTag => &self.meta_tag,
            RecordKind::Technique => &self.technique,
        }
    }
}

impl Default for SectionIndicators {
    fn default() -> Self {
        Self {
            genre: defaults::genre_indicators(),
            meta_tag: defaults::meta_tag_indicators(),
            technique: defaults::technique_indicators(),
        }
    }
}

pub mod defaults {
    use std::path::PathBuf;

    pub fn enabled() -> bool {
        true
    }
    pub fn local_storage_path() -> PathBuf {
        PathBuf::from("data/reference")
    }
    pub fn refresh_interval_hours() -> f64 {
        24.0
    }
    pub fn request_timeout() -> f64 {
        30.0
    }
    pub fn max_retries() -> i64 {
        3
    }
    pub fn retry_delay() -> f64 {
        1.0
    }
    pub fn max_retry_delay() -> f64 {
        30.0
    }
    pub fn max_concurrent_fetches() -> i64 {
        4
    }
    pub fn fallback_enabled() -> bool {
        true
    }
    pub fn user_agent() -> String {
        "Mozilla/5.0 (compatible; refcrawl/1.0)".into()
    }
    pub fn log_level() -> String {
        "info".into()
    }
    pub fn circuit_failure_threshold() -> u32 {
        5
    }
    pub fn circuit_open_seconds() -> f64 {
        60.0
    }
    pub fn evict_on_write() -> bool {
        true
    }
    pub fn min_free_space_bytes() -> u64 {
        10 * 1024 * 1024
    }
    pub fn watch_debounce_millis() -> u64 {
        500
    }
    pub fn fallback_quality() -> f64 {
        0.1
    }

    // Cache quality defaults
    pub fn cache_quality_ceiling() -> f64 {
        0.9
    }
    pub fn cache_quality_discount() -> f64 {
        0.01
    }
    pub fn cache_quality_floor() -> f64 {
        0.3
    }

    // Monitor defaults
    pub fn monitor_window() -> u64 {
        300
    }
    pub fn alert_threshold() -> usize {
        5
    }
    pub fn history_capacity() -> usize {
        200
    }
    pub fn degraded_error_count() -> usize {
        10
    }
    pub fn warning_event_count() -> usize {
        3
    }

    // Section indicator defaults
    pub fn genre_indicators() -> Vec<String> {
        [
            "genre", "style", "electronic", "rock", "pop", "hip hop", "hip-hop", "rap", "jazz",
            "blues", "classical", "orchestral", "folk", "country", "metal", "punk", "r&b", "soul",
            "funk", "latin", "world", "reggae", "dance", "ambient", "experimental",
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }
    pub fn meta_tag_indicators() -> Vec<String> {
        [
            "tag", "meta", "structure", "section", "vocal", "instrument", "mood", "effect",
            "production", "tempo", "dynamics",
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }
    pub fn technique_indicators() -> Vec<String> {
        [
            "tip", "technique", "trick", "guide", "how to", "best practice", "prompt", "workflow",
            "advice",
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }
}
