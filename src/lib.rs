// src/lib.rs

//! Reference-data crawler: fetches genre, meta-tag and technique pages,
//! caches them on disk and serves parsed records with graceful degradation.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use refcrawl::{ConfigManager, DataManager, RecordKind};
//!
//! # async fn run() -> refcrawl::error::Result<()> {
//! let config = Arc::new(ConfigManager::open("refcrawl.json")?);
//! refcrawl::utils::log::init(&config.current().log_level);
//! let _watch = config.watch()?;
//!
//! let manager = DataManager::new(config);
//! manager.refresh(false).await;
//! let genres = manager.resolved(RecordKind::Genre).await;
//! println!("{} genres from {} data", genres.records.len(), genres.data_source);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod manager;
pub mod models;
pub mod pipeline;
pub mod services;
pub mod storage;
pub mod utils;

pub use config::{ConfigListener, ConfigManager, ConfigWatch, ReloadOutcome};
pub use error::{AppError, Result};
pub use manager::DataManager;
pub use models::{
    Config, DataSource, DomainRecord, HealthReport, HealthStatus, RecordKind, ResolvedRecords,
    ValidationResult,
};
pub use pipeline::RefreshResult;
