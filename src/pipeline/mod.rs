//! Pipeline stages built on top of the services.
//!
//! - `RetryEngine`: backoff and per-kind circuit breaking around any async action
//! - `RecoveryLayer`: live, cached or built-in records with a quality score
//! - `run_refresh`: one refresh cycle over every configured source

pub mod circuit_breaker;
pub mod recovery;
pub mod refresh;
pub mod retry;

pub use circuit_breaker::{
    Admission, CircuitBreaker, CircuitBreakerConfig, CircuitState, RetrySession,
};
pub use recovery::RecoveryLayer;
pub use refresh::{RefreshResult, run_refresh};
pub use retry::{RetryEngine, RetryPolicy};
