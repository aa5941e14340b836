// src/utils/url.rs

//! URL validation and helpers.

use url::Url;

use crate::error::{AppError, Result};

/// Parse and validate a source URL.
///
/// Accepts only `http`/`https` URLs with a non-empty host.
///
/// # Examples
/// ```
/// use refcrawl::utils::url::validate_source_url;
///
/// assert!(validate_source_url("https://example.com/genres").is_ok());
/// assert!(validate_source_url("ftp://example.com/genres").is_err());
/// ```
pub fn validate_source_url(raw: &str) -> Result<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AppError::invalid_url(raw, "empty URL"));
    }
    let parsed = Url::parse(trimmed).map_err(|e| AppError::invalid_url(raw, e))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(AppError::invalid_url(
            raw,
            format!("unsupported scheme '{}'", parsed.scheme()),
        ));
    }
    match parsed.host_str() {
        Some(host) if !host.is_empty() => Ok(parsed),
        _ => Err(AppError::invalid_url(raw, "missing host")),
    }
}

/// Validity predicate for source URLs.
pub fn is_valid_source_url(raw: &str) -> bool {
    validate_source_url(raw).is_ok()
}
