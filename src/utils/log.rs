// src/utils/log.rs

//! Centralized logging setup with server-style formatting.
//!
//! Library code logs through the `log` macros; hosts call [`init`] once to
//! install an `env_logger` backend printing `[timestamp] [LEVEL] message`.

use std::io::Write;

use chrono::Local;
use log::LevelFilter;

/// Parse a level name, falling back to `Info`.
pub fn level_from_str(s: &str) -> LevelFilter {
    match s.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" | "warning" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        "off" => LevelFilter::Off,
        _ => LevelFilter::Info,
    }
}

/// Initialize the logging backend. Later calls are no-ops.
pub fn init(level: &str) {
    let _ = env_logger::Builder::new()
        .filter_level(level_from_str(level))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] [{}] {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .try_init();
}

/// Log a summary section
pub fn summary(title: &str, items: &[(&str, String)]) {
    log::info!("[SUMMARY] {}", title);
    for (key, value) in items {
        log::info!("    {}: {}", key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_from_str() {
        assert_eq!(level_from_str("debug"), LevelFilter::Debug);
        assert_eq!(level_from_str("INFO"), LevelFilter::Info);
        assert_eq!(level_from_str("warning"), LevelFilter::Warn);
        assert_eq!(level_from_str("unknown"), LevelFilter::Info);
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init("debug");
        init("error");
    }
}
