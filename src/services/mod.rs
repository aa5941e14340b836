//! Service layer.
//!
//! - Page fetching into the document cache (`Fetcher`)
//! - HTML to record parsing (`ContentParser`)
//! - Error event aggregation and health (`ErrorMonitor`)
//! - Built-in records for when everything else fails (`fallback`)

pub mod fallback;
mod fetcher;
mod monitor;
mod parser;
pub mod vocabulary;

pub use fetcher::{
    BatchOptions, BatchProgress, BatchResult, FetchJob, FetchResult, Fetcher, OutcomeStatus,
    UrlOutcome,
};
pub use monitor::{AlertListener, ErrorMonitor};
pub use parser::{ContentParser, ParseOutcome};
