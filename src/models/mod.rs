// src/models/mod.rs

//! Domain models for the reference-data pipeline.
//!
//! This module contains all data structures shared between components,
//! organized by their primary purpose.

mod cache;
mod config;
mod event;
mod record;
mod validation;

// Re-export all public types
pub use cache::{CacheEntry, CacheStats};
pub use config::{CacheQualityConfig, Config, MonitorConfig, SectionIndicators, defaults};
pub use event::{Alert, ErrorEvent, HealthReport, HealthStatus, Severity};
pub use record::{
    DataSource, DomainRecord, GenreRecord, MetaTagRecord, RecordKind, RecordMeta,
    ResolvedRecords, TechniqueRecord,
};
pub use validation::{StorageDiagnostics, UrlCheck, ValidationResult};
