// src/pipeline/refresh.rs

//! Refresh cycle: one batch fetch over every configured source.

use serde::Serialize;

use crate::models::Config;
use crate::services::{BatchOptions, FetchJob, Fetcher, OutcomeStatus};
use crate::utils::log::summary;

/// Outcome of one refresh cycle.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResult {
    /// True when no URL failed
    pub success: bool,
    pub downloaded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// "url: error" for every failed URL
    pub errors: Vec<String>,
    pub elapsed_ms: u64,
}

/// Fetch every source in `config`.
///
/// Without `force`, URLs cached within `refreshIntervalHours` are skipped.
pub async fn run_refresh(fetcher: &Fetcher, config: &Config, force: bool) -> RefreshResult {
    let jobs: Vec<FetchJob> = config
        .all_sources()
        .into_iter()
        .map(|(kind, url)| FetchJob::new(kind, url))
        .collect();
    let options = BatchOptions {
        max_age_hours: (!force).then_some(config.refresh_interval_hours),
        max_concurrent: config.max_concurrent(),
        deadline: config.batch_deadline(),
    };

    log::info!(
        "Refreshing {} sources{}",
        jobs.len(),
        if force { " (forced)" } else { "" }
    );

    let batch = fetcher
        .fetch_all(jobs, options, |progress| {
            log::debug!(
                "[{}/{}] {}",
                progress.completed,
                progress.total,
                progress.outcome.url
            );
        })
        .await;

    let errors: Vec<String> = batch
        .outcomes
        .iter()
        .filter_map(|outcome| match &outcome.status {
            OutcomeStatus::Failed { error } => Some(format!("{}: {}", outcome.url, error)),
            _ => None,
        })
        .collect();

    let result = RefreshResult {
        success: batch.failed_downloads == 0,
        downloaded: batch.successful_downloads,
        failed: batch.failed_downloads,
        skipped: batch.skipped,
        errors,
        elapsed_ms: batch.elapsed_ms,
    };

    summary(
        "Refresh",
        &[
            ("Downloaded", result.downloaded.to_string()),
            ("Failed", result.failed.to_string()),
            ("Skipped", result.skipped.to_string()),
            ("Elapsed", format!("{} ms", result.elapsed_ms)),
        ],
    );
    result
}
