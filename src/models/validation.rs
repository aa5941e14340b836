//! Configuration validation results.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;

/// Accessibility of one configured source URL.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlCheck {
    pub syntax_ok: bool,
    /// `None` unless a reachability check was requested
    pub reachable: Option<bool>,
    pub status_code: Option<u16>,
    pub error: Option<String>,
}

/// Storage path diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageDiagnostics {
    pub path: PathBuf,
    pub exists: bool,
    pub writable: bool,
    pub free_bytes: Option<u64>,
}

/// Outcome of one validation call. Built fresh each time.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub url_accessibility: BTreeMap<String, UrlCheck>,
    pub storage: StorageDiagnostics,
}

impl ValidationResult {
    /// Error list joined for log lines.
    pub fn error_summary(&self) -> String {
        self.errors.join("; ")
    }
}
