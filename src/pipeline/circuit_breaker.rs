//! Circuit Breaker pattern implementation.
//!
//! One session per operation kind (e.g. `fetch-genre-page`), shared by every
//! caller of that kind.
//!
//! ```text
//!   closed ──(threshold consecutive failures)──▶ open
//!     ▲                                           │
//!     │ trial succeeds            open-until elapses
//!     │                                           ▼
//!     └──────────────────────────────────── half-open ──(trial fails)──▶ open
//! ```
//!
//! While half-open exactly one trial attempt is admitted; everyone else fails
//! fast until that trial reports back.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

/// Attempt timestamps kept per session.
const RECENT_ATTEMPTS: usize = 32;

/// Circuit breaker configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit. Default: 5
    pub failure_threshold: u32,
    /// How long an open circuit rejects attempts. Default: 60s
    pub open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(60),
        }
    }
}

/// Circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-operation-kind session state.
#[derive(Debug, Clone)]
pub struct RetrySession {
    pub recent_attempts: VecDeque<Instant>,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub open_until: Option<Instant>,
    trial_in_flight: bool,
}

impl Default for RetrySession {
    fn default() -> Self {
        Self {
            recent_attempts: VecDeque::with_capacity(RECENT_ATTEMPTS),
            state: CircuitState::Closed,
            consecutive_failures: 0,
            open_until: None,
            trial_in_flight: false,
        }
    }
}

/// Decision taken before an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed, go ahead
    Proceed,
    /// Circuit was open and has just become half-open; this is the trial
    Trial,
    /// Fail fast without attempting
    Rejected { retry_after: Duration },
}

/// Holds the half-open trial slot of one kind while the trial runs.
///
/// Dropping an armed guard frees the slot, so a trial whose future is
/// cancelled before it reports lets the next caller run a new trial.
#[must_use]
pub struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    kind: &'a str,
    armed: bool,
}

impl TrialGuard<'_> {
    /// The trial reported back through `record_success`/`record_failure`.
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            log::debug!("Trial for circuit '{}' ended without a verdict", self.kind);
            self.breaker.release_trial(self.kind);
        }
    }
}

/// Thread-safe registry of per-kind circuits.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    sessions: Mutex<HashMap<String, RetrySession>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with default configuration.
    pub fn new() -> Self {
        Self::with_config(CircuitBreakerConfig::default())
    }

    /// Create a new circuit breaker with custom configuration.
    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        self.config
    }

    /// Decide whether an attempt for `kind` may run now.
    pub fn admit(&self, kind: &str) -> Admission {
        let now = Instant::now();
        let mut sessions = self.sessions.lock();
        let session = sessions.entry(kind.to_string()).or_default();

        let admission = match session.state {
            CircuitState::Closed => Admission::Proceed,
            CircuitState::Open => match session.open_until {
                Some(until) if now < until => Admission::Rejected {
                    retry_after: until - now,
                },
                _ => {
                    log::info!("Circuit '{}' half-open, allowing one trial attempt", kind);
                    session.state = CircuitState::HalfOpen;
                    session.trial_in_flight = true;
                    Admission::Trial
                }
            },
            CircuitState::HalfOpen if session.trial_in_flight => Admission::Rejected {
                retry_after: Duration::ZERO,
            },
            CircuitState::HalfOpen => {
                session.trial_in_flight = true;
                Admission::Trial
            }
        };

        if !matches!(admission, Admission::Rejected { .. }) {
            if session.recent_attempts.len() == RECENT_ATTEMPTS {
                session.recent_attempts.pop_front();
            }
            session.recent_attempts.push_back(now);
        }
        admission
    }

    /// Guard for `admission`; armed only when it is the half-open trial.
    pub fn guard<'a>(&'a self, kind: &'a str, admission: Admission) -> TrialGuard<'a> {
        TrialGuard {
            breaker: self,
            kind,
            armed: admission == Admission::Trial,
        }
    }

    /// Report a successful attempt.
    pub fn record_success(&self, kind: &str) {
        let mut sessions = self.sessions.lock();
        let session = sessions.entry(kind.to_string()).or_default();
        if session.state != CircuitState::Closed {
            log::info!("Circuit '{}' closed after successful trial", kind);
        }
        session.state = CircuitState::Closed;
        session.consecutive_failures = 0;
        session.open_until = None;
        session.trial_in_flight = false;
    }

    /// Report a failed attempt. Returns true if this failure opened the circuit.
    pub fn record_failure(&self, kind: &str) -> bool {
        let now = Instant::now();
        let mut sessions = self.sessions.lock();
        let session = sessions.entry(kind.to_string()).or_default();
        session.consecutive_failures = session.consecutive_failures.saturating_add(1);

        let should_open = match session.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => session.consecutive_failures >= self.config.failure_threshold,
            CircuitState::Open => false,
        };

        if should_open {
            session.state = CircuitState::Open;
            session.open_until = Some(now + self.config.open_duration);
            session.trial_in_flight = false;
            log::warn!(
                "Circuit '{}' OPEN after {} consecutive failures (for {:?})",
                kind,
                session.consecutive_failures,
                self.config.open_duration
            );
        }
        should_open
    }

    /// Release a half-open trial slot without judging the circuit.
    ///
    /// Used when the trial ended in a failure that says nothing about the
    /// remote side (bad input, local storage) or never finished.
    pub fn release_trial(&self, kind: &str) {
        if let Some(session) = self.sessions.lock().get_mut(kind) {
            if session.state == CircuitState::HalfOpen {
                session.trial_in_flight = false;
            }
        }
    }

    /// Snapshot of a session.
    pub fn session(&self, kind: &str) -> Option<RetrySession> {
        self.sessions.lock().get(kind).cloned()
    }

    /// Current state for `kind` (closed when unknown).
    pub fn state(&self, kind: &str) -> CircuitState {
        self.sessions
            .lock()
            .get(kind)
            .map_or(CircuitState::Closed, |s| s.state)
    }

    /// Forget every session.
    pub fn reset(&self) {
        self.sessions.lock().clear();
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::with_config(CircuitBreakerConfig {
            failure_threshold: threshold,
            open_duration: Duration::from_secs(30),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let cb = breaker(3);
        for _ in 0..2 {
            assert_eq!(cb.admit("fetch"), Admission::Proceed);
            assert!(!cb.record_failure("fetch"));
        }
        assert_eq!(cb.admit("fetch"), Admission::Proceed);
        assert!(cb.record_failure("fetch"));
        assert_eq!(cb.state("fetch"), CircuitState::Open);
        assert!(matches!(cb.admit("fetch"), Admission::Rejected { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let cb = breaker(2);
        cb.admit("fetch");
        cb.record_failure("fetch");
        cb.admit("fetch");
        cb.record_success("fetch");
        cb.admit("fetch");
        assert!(!cb.record_failure("fetch"));
        assert_eq!(cb.state("fetch"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_allows_exactly_one_trial() {
        let cb = breaker(1);
        cb.admit("fetch");
        cb.record_failure("fetch");

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(cb.admit("fetch"), Admission::Trial);
        assert!(matches!(cb.admit("fetch"), Admission::Rejected { .. }));

        cb.record_success("fetch");
        assert_eq!(cb.state("fetch"), CircuitState::Closed);
        assert_eq!(cb.admit("fetch"), Admission::Proceed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens_with_fresh_deadline() {
        let cb = breaker(1);
        cb.admit("fetch");
        cb.record_failure("fetch");

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(cb.admit("fetch"), Admission::Trial);
        assert!(cb.record_failure("fetch"));

        match cb.admit("fetch") {
            Admission::Rejected { retry_after } => {
                assert!(retry_after > Duration::from_secs(29));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_guard_frees_the_slot() {
        let cb = breaker(1);
        cb.admit("fetch");
        cb.record_failure("fetch");
        tokio::time::advance(Duration::from_secs(31)).await;

        let admission = cb.admit("fetch");
        assert_eq!(admission, Admission::Trial);
        let guard = cb.guard("fetch", admission);
        assert!(matches!(cb.admit("fetch"), Admission::Rejected { .. }));
        drop(guard);

        assert_eq!(cb.state("fetch"), CircuitState::HalfOpen);
        assert_eq!(cb.admit("fetch"), Admission::Trial);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarmed_guard_keeps_verdict() {
        let cb = breaker(1);
        cb.admit("fetch");
        cb.record_failure("fetch");
        tokio::time::advance(Duration::from_secs(31)).await;

        let admission = cb.admit("fetch");
        let guard = cb.guard("fetch", admission);
        cb.record_failure("fetch");
        guard.disarm();
        assert!(matches!(cb.admit("fetch"), Admission::Rejected { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_kinds_are_independent() {
        let cb = breaker(1);
        cb.admit("fetch-genre-page");
        cb.record_failure("fetch-genre-page");
        assert_eq!(cb.admit("fetch-technique-page"), Admission::Proceed);
        assert_eq!(cb.session("fetch-genre-page").unwrap().recent_attempts.len(), 1);
    }
}
