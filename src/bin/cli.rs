//! refcrawl CLI
//!
//! Operator entry point over the `DataManager` API: refresh the cache,
//! inspect records, cache statistics and health, validate a config file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use refcrawl::{
    ConfigManager, DataManager, RecordKind,
    error::Result,
    utils::log::{self as logging, summary},
};

/// refcrawl - reference data crawler
#[derive(Parser, Debug)]
#[command(
    name = "refcrawl",
    version,
    about = "Fetches and serves genre, meta-tag and technique reference data"
)]
struct Cli {
    /// Path to the config file (JSON, or TOML by extension)
    #[arg(short, long, default_value = "data/refcrawl.json")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download every configured source page
    Refresh {
        /// Re-download pages that are still fresh
        #[arg(long)]
        force: bool,
    },

    /// Print resolved records of one kind as JSON
    Records {
        #[arg(value_enum)]
        kind: KindArg,
    },

    /// Show cache statistics
    Stats,

    /// Show health status and active alerts
    Health,

    /// Validate the config file
    Validate {
        /// Also request every source URL
        #[arg(long)]
        check_urls: bool,
    },

    /// Delete every cached document
    Clear,

    /// Refresh periodically and hot-reload the config until interrupted
    Serve,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum KindArg {
    Genre,
    MetaTag,
    Technique,
}

impl From<KindArg> for RecordKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Genre => RecordKind::Genre,
            KindArg::MetaTag => RecordKind::MetaTag,
            KindArg::Technique => RecordKind::Technique,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Command::Validate { check_urls } = cli.command {
        logging::init(if cli.verbose { "debug" } else { "info" });
        return validate(&cli.config, check_urls).await;
    }

    let config = Arc::new(ConfigManager::open(&cli.config)?);
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.current().log_level.clone()
    };
    logging::init(&level);
    let manager = DataManager::new(Arc::clone(&config));

    match cli.command {
        Command::Refresh { force } => {
            let result = manager.refresh(force).await;
            for error in &result.errors {
                log::error!("{}", error);
            }
            if !result.success {
                log::warn!("{} sources failed", result.failed);
            }
        }

        Command::Records { kind } => {
            let resolved = manager.resolved(kind.into()).await;
            log::info!(
                "{} {} records from {} data (quality {:.2})",
                resolved.records.len(),
                resolved.kind,
                resolved.data_source,
                resolved.quality_score
            );
            println!("{}", serde_json::to_string_pretty(resolved.as_ref())?);
        }

        Command::Stats => {
            let stats = manager.cache_stats().await?;
            let mut items = vec![
                ("Entries", stats.entry_count.to_string()),
                ("Bytes", stats.total_bytes.to_string()),
            ];
            for kind in RecordKind::ALL {
                let count = stats.by_kind.get(&kind).copied().unwrap_or(0);
                items.push((kind.as_str(), count.to_string()));
            }
            if let Some(oldest) = stats.oldest_fetch {
                items.push(("Oldest", oldest.to_rfc3339()));
            }
            if let Some(newest) = stats.newest_fetch {
                items.push(("Newest", newest.to_rfc3339()));
            }
            summary("Cache", &items);
        }

        Command::Health => {
            println!("{}", serde_json::to_string_pretty(&manager.health_status())?);
        }

        Command::Clear => manager.clear_cache().await?,

        Command::Serve => {
            let _watch = config.watch()?;
            let refresher = manager.spawn_auto_refresh();
            manager.refresh(false).await;

            log::info!("Serving; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            refresher.abort();
        }

        Command::Validate { .. } => {}
    }

    Ok(())
}

async fn validate(path: &Path, check_urls: bool) -> Result<()> {
    let config = ConfigManager::load(path)?;
    let result = if check_urls {
        let source = refcrawl::utils::http::ReqwestSource::from_config(&config)?;
        ConfigManager::validate_with_reachability(&config, &source).await
    } else {
        ConfigManager::validate(&config)
    };

    for warning in &result.warnings {
        log::warn!("{}", warning);
    }
    for error in &result.errors {
        log::error!("{}", error);
    }
    println!("{}", serde_json::to_string_pretty(&result)?);

    if result.valid {
        log::info!("{:?} is valid", path);
        Ok(())
    } else {
        Err(refcrawl::AppError::validation(result.error_summary()))
    }
}
