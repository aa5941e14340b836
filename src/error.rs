// src/error.rs

//! Unified error handling for the reference-data pipeline.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, AppError>;

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// Source URL failed the syntax check
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Configuration or input value out of range
    #[error("Validation error: {0}")]
    Validation(String),

    /// Connection reset, DNS failure and other short-lived network faults
    #[error("Transient fetch error for {context}: {message}")]
    Transient { context: String, message: String },

    /// Request exceeded its per-request timeout
    #[error("Request to {context} timed out after {after:?}")]
    Timeout { context: String, after: Duration },

    /// Server answered with a non-success status
    #[error("HTTP {status} from {url}")]
    HttpStatus { url: String, status: u16 },

    /// Circuit for an operation kind is open
    #[error("Circuit open for '{kind}', retry in {retry_after:?}")]
    CircuitOpen { kind: String, retry_after: Duration },

    /// Batch deadline passed before the request finished
    #[error("Deadline exceeded for {0}")]
    DeadlineExceeded(String),

    /// Document is empty or not HTML at all
    #[error("Malformed document from {source_url}: {reason}")]
    MalformedDocument { source_url: String, reason: String },

    /// Disk full, permission denied, missing body file
    #[error("Storage error at {path:?}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// URL parsing failed
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    /// File watcher could not be installed
    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    /// CSS selector parsing failed
    #[error("Invalid selector '{selector}': {message}")]
    Selector { selector: String, message: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl AppError {
    /// Create an invalid-URL error.
    pub fn invalid_url(url: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a transient fetch error with context.
    pub fn transient(context: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Transient {
            context: context.into(),
            message: message.to_string(),
        }
    }

    /// Create a malformed-document error.
    pub fn malformed(source_url: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::MalformedDocument {
            source_url: source_url.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a storage error for a path.
    pub fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }

    /// Create a selector parsing error.
    pub fn selector(selector: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Selector {
            selector: selector.into(),
            message: message.to_string(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether another attempt may succeed.
    ///
    /// Timeouts, 5xx, 408/429 and connection-level faults are retryable.
    /// Everything describing bad input, other 4xx or local failures is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transient { .. } | Self::Timeout { .. } => true,
            Self::HttpStatus { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request() || e.is_body(),
            _ => false,
        }
    }

    /// Short stable label used in error events and batch outcomes.
    pub fn kind_label(&self) -> &'static str {
        match self {
            Self::InvalidUrl { .. } | Self::Validation(_) => "validation",
            Self::Transient { .. } => "transient",
            Self::Timeout { .. } => "timeout",
            Self::HttpStatus { .. } => "http_status",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::DeadlineExceeded(_) => "deadline",
            Self::MalformedDocument { .. } | Self::Selector { .. } => "parse",
            Self::Storage { .. } | Self::Io(_) => "storage",
            Self::Http(_) => "http",
            Self::Json(_) | Self::Toml(_) => "serialization",
            Self::Url(_) => "validation",
            Self::Watch(_) | Self::Config(_) => "config",
        }
    }

    /// Storage-class failures (the coordinator falls back to built-in data on these).
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage { .. } | Self::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_errors_are_retryable() {
        let err = AppError::HttpStatus {
            url: "https://example.com".into(),
            status: 503,
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn test_client_errors_are_not_retryable() {
        let err = AppError::HttpStatus {
            url: "https://example.com".into(),
            status: 404,
        };
        assert!(!err.is_retryable());

        let throttled = AppError::HttpStatus {
            url: "https://example.com".into(),
            status: 429,
        };
        assert!(throttled.is_retryable());
    }

    #[test]
    fn test_validation_and_circuit_are_not_retryable() {
        assert!(!AppError::invalid_url("ftp://x", "bad scheme").is_retryable());
        let open = AppError::CircuitOpen {
            kind: "fetch".into(),
            retry_after: Duration::from_secs(1),
        };
        assert!(!open.is_retryable());
        assert_eq!(open.kind_label(), "circuit_open");
    }

    #[test]
    fn test_timeout_is_retryable() {
        let err = AppError::Timeout {
            context: "https://example.com".into(),
            after: Duration::from_secs(5),
        };
        assert!(err.is_retryable());
        assert_eq!(err.kind_label(), "timeout");
    }
}
