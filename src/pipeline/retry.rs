// src/pipeline/retry.rs

//! Retry engine: exponential backoff with jitter behind per-kind circuits.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::models::{Config, ErrorEvent, Severity};
use crate::pipeline::circuit_breaker::{Admission, CircuitBreaker, CircuitBreakerConfig};
use crate::services::ErrorMonitor;

const COMPONENT: &str = "retry";

/// Backoff settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Attempts including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Multiply each delay by a random factor in [0.5, 1.5)
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.max_attempts(),
            base_delay: config.retry_delay(),
            max_delay: config.max_retry_delay(),
            jitter: true,
        }
    }

    /// Delay before attempt `attempt + 1`, given that `attempt` (1-based) failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30) as i32;
        let factor = if self.jitter { 0.5 + fastrand::f64() } else { 1.0 };
        let secs = self.base_delay.as_secs_f64() * 2f64.powi(exponent) * factor;
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()).max(0.0))
    }
}

/// Generic retry/circuit-breaker primitive.
pub struct RetryEngine {
    policy: RetryPolicy,
    breaker: CircuitBreaker,
    monitor: Option<Arc<ErrorMonitor>>,
}

impl RetryEngine {
    pub fn new(policy: RetryPolicy, breaker: CircuitBreakerConfig) -> Self {
        Self {
            policy,
            breaker: CircuitBreaker::with_config(breaker),
            monitor: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            RetryPolicy::from_config(config),
            CircuitBreakerConfig {
                failure_threshold: config.circuit_failure_threshold,
                open_duration: config.circuit_open_duration(),
            },
        )
    }

    /// Report every attempt outcome to `monitor`.
    pub fn with_monitor(mut self, monitor: Arc<ErrorMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Run `action` under the policy and the circuit for `kind`.
    pub async fn execute<T, F, Fut>(&self, kind: &str, action: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with_context(kind, kind, action).await
    }

    /// Like [`execute`](Self::execute), tagging events with `context` (e.g. the URL).
    pub async fn execute_with_context<T, F, Fut>(
        &self,
        kind: &str,
        context: &str,
        mut action: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let admission = self.breaker.admit(kind);
            if let Admission::Rejected { retry_after } = admission {
                let error = AppError::CircuitOpen {
                    kind: kind.to_string(),
                    retry_after,
                };
                self.report(
                    Severity::Warning,
                    kind,
                    context,
                    format!("failing fast: {error}"),
                    true,
                    Some(error.kind_label()),
                );
                return Err(error);
            }

            let trial = self.breaker.guard(kind, admission);
            match action().await {
                Ok(value) => {
                    self.breaker.record_success(kind);
                    trial.disarm();
                    self.report(
                        Severity::Info,
                        kind,
                        context,
                        format!("attempt {attempt}/{max_attempts} succeeded"),
                        true,
                        None,
                    );
                    return Ok(value);
                }
                Err(error) if !error.is_retryable() => {
                    // Says nothing about the remote side: the guard frees the slot.
                    drop(trial);
                    self.report(
                        Severity::Error,
                        kind,
                        context,
                        format!("attempt {attempt}/{max_attempts} failed, not retryable: {error}"),
                        false,
                        Some(error.kind_label()),
                    );
                    return Err(error);
                }
                Err(error) => {
                    let opened = self.breaker.record_failure(kind);
                    trial.disarm();
                    let last = attempt >= max_attempts || opened;
                    let message = if last {
                        format!("attempt {attempt}/{max_attempts} failed, giving up: {error}")
                    } else {
                        format!("attempt {attempt}/{max_attempts} failed, will retry: {error}")
                    };
                    self.report(
                        if last { Severity::Error } else { Severity::Warning },
                        kind,
                        context,
                        message,
                        true,
                        Some(error.kind_label()),
                    );
                    if last {
                        return Err(error);
                    }

                    let delay = self.policy.delay_for(attempt);
                    log::debug!("Retrying {} in {:?}", context, delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn report(
        &self,
        severity: Severity,
        kind: &str,
        context: &str,
        message: String,
        recoverable: bool,
        error_kind: Option<&str>,
    ) {
        let Some(monitor) = &self.monitor else {
            return;
        };
        let mut event = ErrorEvent::new(severity, COMPONENT, kind, message)
            .with_context(context)
            .recoverable(recoverable);
        if let Some(label) = error_kind {
            event = event.with_error_kind(label);
        }
        monitor.record(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MonitorConfig;
    use crate::pipeline::circuit_breaker::CircuitState;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn engine(max_attempts: u32, threshold: u32) -> RetryEngine {
        RetryEngine::new(
            RetryPolicy {
                max_attempts,
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(1),
                jitter: true,
            },
            CircuitBreakerConfig {
                failure_threshold: threshold,
                open_duration: Duration::from_secs(60),
            },
        )
    }

    fn server_error() -> AppError {
        AppError::HttpStatus {
            url: "https://example.com".into(),
            status: 502,
        }
    }

    #[test]
    fn test_delay_grows_and_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            jitter: false,
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            jitter: true,
        };
        for _ in 0..100 {
            let d = policy.delay_for(2).as_secs_f64();
            assert!((2.0..6.0).contains(&d), "delay {d} out of range");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let engine = engine(4, 10);
        let calls = AtomicU32::new(0);
        let result = engine
            .execute("fetch", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(server_error())
                } else {
                    Ok("body")
                }
            })
            .await;
        assert_eq!(result.unwrap(), "body");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let engine = engine(3, 10);
        let calls = AtomicU32::new(0);
        let result: Result<()> = engine
            .execute("fetch", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(server_error())
            })
            .await;
        assert!(matches!(result, Err(AppError::HttpStatus { status: 502, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_aborts_immediately() {
        let engine = engine(5, 10);
        let calls = AtomicU32::new(0);
        let result: Result<()> = engine
            .execute("fetch", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AppError::HttpStatus {
                    url: "https://example.com".into(),
                    status: 404,
                })
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.breaker().state("fetch"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_fails_fast_then_allows_one_trial() {
        let engine = engine(1, 3);
        let calls = AtomicU32::new(0);
        let failing = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(server_error())
        };

        for _ in 0..3 {
            assert!(engine.execute("fetch", failing).await.is_err());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let fast = engine.execute("fetch", failing).await;
        assert!(matches!(fast, Err(AppError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(engine.execute("fetch", failing).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(engine.breaker().state("fetch"), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(61)).await;
        let ok = engine.execute("fetch", || async { Ok(1) }).await;
        assert_eq!(ok.unwrap(), 1);
        assert_eq!(engine.breaker().state("fetch"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_trial_does_not_wedge_circuit() {
        let engine = engine(1, 1);
        let failed: Result<()> = engine.execute("fetch", || async { Err(server_error()) }).await;
        assert!(failed.is_err());
        tokio::time::advance(Duration::from_secs(61)).await;

        let hung = tokio::time::timeout(
            Duration::from_millis(50),
            engine.execute("fetch", || async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }),
        )
        .await;
        assert!(hung.is_err());
        assert_eq!(engine.breaker().state("fetch"), CircuitState::HalfOpen);

        let ok = engine.execute("fetch", || async { Ok("page") }).await;
        assert_eq!(ok.unwrap(), "page");
        assert_eq!(engine.breaker().state("fetch"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_attempt_is_reported() {
        let monitor = Arc::new(ErrorMonitor::new(MonitorConfig::default()));
        let engine = engine(4, 10).with_monitor(monitor.clone());
        let calls = AtomicU32::new(0);
        engine
            .execute_with_context("fetch", "https://example.com/2", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(server_error())
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap();

        let events = monitor.events_for("https://example.com/2");
        let severities: Vec<Severity> = events.iter().map(|e| e.severity).collect();
        assert_eq!(
            severities,
            vec![Severity::Warning, Severity::Warning, Severity::Info]
        );
        assert!(events[..2].iter().all(|e| e.recoverable));
    }
}
