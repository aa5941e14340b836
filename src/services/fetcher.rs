// src/services/fetcher.rs

//! Source page fetcher.
//!
//! Validates URLs, performs one GET through the retry engine, and writes
//! successful bodies through the document cache. With a parser attached, a
//! body that yields no records is rejected and the cached copy is kept.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::time::Instant;

use crate::error::{AppError, Result};
use crate::models::{CacheEntry, ErrorEvent, RecordKind, Severity};
use crate::pipeline::RetryEngine;
use crate::services::{ContentParser, ErrorMonitor};
use crate::storage::DocumentCache;
use crate::utils::http::HttpSource;
use crate::utils::url::validate_source_url;

const COMPONENT: &str = "fetcher";

/// Result of fetching one URL. Failures are values, never raised.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub url: String,
    pub kind: RecordKind,
    pub success: bool,
    pub status_code: Option<u16>,
    pub bytes: Option<Vec<u8>>,
    pub error: Option<String>,
    /// `AppError::kind_label` of the failure
    pub error_kind: Option<&'static str>,
    /// Cache row written for this body, if the write succeeded
    pub entry: Option<CacheEntry>,
}

impl FetchResult {
    fn failed(url: &str, kind: RecordKind, error: &AppError) -> Self {
        let status_code = match error {
            AppError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        };
        Self {
            url: url.to_string(),
            kind,
            success: false,
            status_code,
            bytes: None,
            error: Some(error.to_string()),
            error_kind: Some(error.kind_label()),
            entry: None,
        }
    }
}

/// One URL to fetch in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchJob {
    pub url: String,
    pub kind: RecordKind,
}

impl FetchJob {
    pub fn new(kind: RecordKind, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            kind,
        }
    }
}

/// Batch fetch options.
#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    /// Skip URLs whose cache entry is younger than this; `None` fetches everything
    pub max_age_hours: Option<f64>,
    pub max_concurrent: usize,
    /// Overall deadline; unfinished requests are abandoned and reported failed
    pub deadline: Option<Duration>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_age_hours: None,
            max_concurrent: 4,
            deadline: None,
        }
    }
}

/// Per-URL outcome in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum OutcomeStatus {
    Downloaded,
    Skipped,
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlOutcome {
    pub url: String,
    pub kind: RecordKind,
    #[serde(flatten)]
    pub status: OutcomeStatus,
    pub status_code: Option<u16>,
}

/// Progress snapshot passed to the batch callback.
#[derive(Debug, Clone)]
pub struct BatchProgress<'a> {
    /// Never decreases between calls
    pub completed: usize,
    pub total: usize,
    pub outcome: &'a UrlOutcome,
}

/// Aggregate batch result.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub attempted: usize,
    pub successful_downloads: usize,
    pub failed_downloads: usize,
    pub skipped: usize,
    pub outcomes: Vec<UrlOutcome>,
    pub elapsed_ms: u64,
}

/// Fetches source pages and caches them.
pub struct Fetcher {
    http: Arc<dyn HttpSource>,
    cache: Arc<dyn DocumentCache>,
    retry: Arc<RetryEngine>,
    monitor: Option<Arc<ErrorMonitor>>,
    parser: Option<ContentParser>,
    timeout: Duration,
}

impl Fetcher {
    pub fn new(
        http: Arc<dyn HttpSource>,
        cache: Arc<dyn DocumentCache>,
        retry: Arc<RetryEngine>,
        timeout: Duration,
    ) -> Self {
        Self {
            http,
            cache,
            retry,
            monitor: None,
            parser: None,
            timeout,
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<ErrorMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Only cache bodies `parser` turns into at least one record.
    pub fn with_parser(mut self, parser: ContentParser) -> Self {
        self.parser = Some(parser);
        self
    }

    pub fn cache(&self) -> &Arc<dyn DocumentCache> {
        &self.cache
    }

    /// Fetch one URL and cache the body on success.
    pub async fn fetch(&self, url: &str, kind: RecordKind) -> FetchResult {
        let parsed = match validate_source_url(url) {
            Ok(parsed) => parsed,
            Err(error) => {
                self.report(Severity::Error, "validate", url, &error);
                return FetchResult::failed(url, kind, &error);
            }
        };

        let http = &self.http;
        let timeout = self.timeout;
        let outcome = self
            .retry
            .execute_with_context(kind.fetch_operation(), url, || {
                let parsed = &parsed;
                async move {
                    let response = http.get(parsed, timeout).await?;
                    if !response.is_success() {
                        return Err(AppError::HttpStatus {
                            url: parsed.to_string(),
                            status: response.status,
                        });
                    }
                    if response.body.iter().all(u8::is_ascii_whitespace) {
                        return Err(AppError::transient(parsed.as_str(), "empty response body"));
                    }
                    Ok(response)
                }
            })
            .await;

        let response = match outcome {
            Ok(response) => response,
            Err(error) => {
                log::warn!("Failed to fetch {}: {}", url, error);
                return FetchResult::failed(url, kind, &error);
            }
        };

        if let Err(error) = self.check_content(&response.body, kind, url) {
            log::warn!("Not caching {}: {}", url, error);
            self.report(Severity::Warning, "content-check", url, &error);
            let mut failed = FetchResult::failed(url, kind, &error);
            failed.status_code = Some(response.status);
            return failed;
        }

        let (entry, error) = match self.cache.put(url, kind, &response.body).await {
            Ok(entry) => (Some(entry), None),
            Err(error) => {
                self.report(Severity::Error, "cache-write", url, &error);
                (None, Some(error.to_string()))
            }
        };

        log::debug!("Fetched {} ({} bytes)", url, response.body.len());
        FetchResult {
            url: url.to_string(),
            kind,
            success: true,
            status_code: Some(response.status),
            bytes: Some(response.body),
            error,
            error_kind: None,
            entry,
        }
    }

    /// Fetch many URLs with bounded concurrency.
    ///
    /// Fresh cache entries are skipped; one URL failing never aborts the batch.
    pub async fn fetch_all<F>(
        &self,
        jobs: Vec<FetchJob>,
        options: BatchOptions,
        on_progress: F,
    ) -> BatchResult
    where
        F: Fn(BatchProgress<'_>),
    {
        let started = Instant::now();
        let deadline = options.deadline.map(|d| started + d);
        let total = jobs.len();
        let mut result = BatchResult::default();
        let mut completed = 0;

        let mut pending = Vec::with_capacity(total);
        for job in jobs {
            let fresh = match options.max_age_hours {
                Some(max_age) => !self.cache.is_stale(&job.url, max_age).await,
                None => false,
            };
            if fresh {
                completed += 1;
                result.skipped += 1;
                let outcome = UrlOutcome {
                    url: job.url,
                    kind: job.kind,
                    status: OutcomeStatus::Skipped,
                    status_code: None,
                };
                on_progress(BatchProgress {
                    completed,
                    total,
                    outcome: &outcome,
                });
                result.outcomes.push(outcome);
            } else {
                pending.push(job);
            }
        }

        result.attempted = pending.len();
        let mut stream = stream::iter(pending)
            .map(|job| async move {
                let fetched = match deadline {
                    Some(deadline) => {
                        match tokio::time::timeout_at(deadline, self.fetch(&job.url, job.kind)).await
                        {
                            Ok(fetched) => fetched,
                            Err(_) => {
                                let error = AppError::DeadlineExceeded(job.url.clone());
                                self.report(Severity::Warning, "batch-deadline", &job.url, &error);
                                FetchResult::failed(&job.url, job.kind, &error)
                            }
                        }
                    }
                    None => self.fetch(&job.url, job.kind).await,
                };
                (job, fetched)
            })
            .buffer_unordered(options.max_concurrent.max(1));

        while let Some((job, fetched)) = stream.next().await {
            completed += 1;
            let status = if fetched.success {
                result.successful_downloads += 1;
                OutcomeStatus::Downloaded
            } else {
                result.failed_downloads += 1;
                OutcomeStatus::Failed {
                    error: fetched.error.clone().unwrap_or_default(),
                }
            };
            let outcome = UrlOutcome {
                url: job.url,
                kind: job.kind,
                status,
                status_code: fetched.status_code,
            };
            on_progress(BatchProgress {
                completed,
                total,
                outcome: &outcome,
            });
            result.outcomes.push(outcome);
        }

        result.elapsed_ms = started.elapsed().as_millis() as u64;
        log::info!(
            "Batch fetch: {} attempted, {} downloaded, {} failed, {} skipped",
            result.attempted,
            result.successful_downloads,
            result.failed_downloads,
            result.skipped
        );
        result
    }

    fn check_content(&self, body: &[u8], kind: RecordKind, url: &str) -> Result<()> {
        let Some(parser) = &self.parser else {
            return Ok(());
        };
        let outcome = parser.parse(body, kind, url)?;
        if outcome.records.is_empty() {
            let reason = outcome
                .warnings
                .into_iter()
                .next()
                .unwrap_or_else(|| format!("no {kind} records found"));
            return Err(AppError::malformed(url, reason));
        }
        Ok(())
    }

    fn report(&self, severity: Severity, operation: &str, url: &str, error: &AppError) {
        if let Some(monitor) = &self.monitor {
            monitor.record(
                ErrorEvent::new(severity, COMPONENT, operation, error.to_string())
                    .with_context(url)
                    .with_error_kind(error.kind_label())
                    .recoverable(error.is_retryable() || !error.is_storage()),
            );
        }
    }
}
