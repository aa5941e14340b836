// src/services/monitor.rs

//! Error monitor service.
//!
//! Collects classified events from every component, keeps a bounded history
//! per component, raises alerts when a (component, severity) pair crosses its
//! count-within-window threshold, and derives an overall health status.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};

use crate::models::{Alert, ErrorEvent, HealthReport, HealthStatus, MonitorConfig, Severity};

/// Callback invoked when a new alert is raised.
pub type AlertListener = Arc<dyn Fn(&Alert) + Send + Sync>;

#[derive(Default)]
struct MonitorState {
    history: HashMap<String, VecDeque<ErrorEvent>>,
    active: HashMap<(String, Severity), Alert>,
    resolved: VecDeque<Alert>,
    last_event: Option<ErrorEvent>,
}

impl MonitorState {
    /// Move an active alert to the resolved list.
    fn retire(&mut self, key: &(String, Severity), capacity: usize) {
        if let Some(alert) = self.active.remove(key) {
            log::info!("Alert cleared: {}", alert.alert_type);
            self.resolved.push_back(alert);
            while self.resolved.len() > capacity {
                self.resolved.pop_front();
            }
        }
    }
}

/// Process-wide sink for classified failures.
pub struct ErrorMonitor {
    config: RwLock<MonitorConfig>,
    state: Mutex<MonitorState>,
    listeners: Mutex<Vec<AlertListener>>,
}

impl ErrorMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config: RwLock::new(config),
            state: Mutex::new(MonitorState::default()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Swap thresholds (history is kept).
    pub fn set_config(&self, config: MonitorConfig) {
        *self.config.write() = config;
    }

    /// Register a listener for newly raised alerts.
    pub fn on_alert(&self, listener: AlertListener) {
        self.listeners.lock().push(listener);
    }

    fn window(&self) -> Duration {
        Duration::seconds(self.config.read().window_seconds as i64)
    }

    /// Record one event.
    pub fn record(&self, event: ErrorEvent) {
        match event.severity {
            Severity::Info => log::debug!(
                "[{}:{}] {}",
                event.component,
                event.operation,
                event.message
            ),
            Severity::Warning => log::warn!(
                "[{}:{}] {}",
                event.component,
                event.operation,
                event.message
            ),
            Severity::Error | Severity::Critical => log::error!(
                "[{}:{}] {} ({})",
                event.component,
                event.operation,
                event.message,
                event.severity
            ),
        }

        let config = self.config.read().clone();
        let window = Duration::seconds(config.window_seconds as i64);

        let raised = {
            let mut state = self.state.lock();
            let history = state.history.entry(event.component.clone()).or_default();

            // Keep time order even if events arrive slightly late
            let pos = history
                .iter()
                .rposition(|e| e.timestamp <= event.timestamp)
                .map_or(0, |i| i + 1);
            history.insert(pos, event.clone());
            while history.len() > config.history_capacity {
                history.pop_front();
            }

            let count = if event.severity >= Severity::Warning {
                let since = event.timestamp - window;
                history
                    .iter()
                    .filter(|e| e.severity == event.severity && e.timestamp > since)
                    .count()
            } else {
                0
            };

            let key = (event.component.clone(), event.severity);
            // An alert whose condition lapsed since it last fired is resolved
            // here, so the next burst raises afresh without a health poll.
            let lapsed = event.severity >= Severity::Warning
                && state.active.get(&key).is_some_and(|alert| {
                    event.timestamp - alert.last_seen > window
                        || (event.timestamp >= alert.last_seen && count < config.alert_threshold)
                });
            if lapsed {
                state.retire(&key, config.history_capacity);
            }

            let raised = if count >= config.alert_threshold && event.severity >= Severity::Warning {
                match state.active.get_mut(&key) {
                    Some(alert) => {
                        alert.last_seen = alert.last_seen.max(event.timestamp);
                        alert.count = count;
                        alert.suppressed = true;
                        None
                    }
                    None => {
                        let alert = Alert {
                            alert_type: format!("{}:{}", event.component, event.severity),
                            component: event.component.clone(),
                            severity: event.severity,
                            first_seen: event.timestamp,
                            last_seen: event.timestamp,
                            count,
                            suppressed: false,
                        };
                        state.active.insert(key, alert.clone());
                        Some(alert)
                    }
                }
            } else {
                None
            };

            state.last_event = Some(event);
            raised
        };

        if let Some(alert) = raised {
            log::warn!(
                "ALERT {}: {} events within {}s",
                alert.alert_type,
                alert.count,
                config.window_seconds
            );
            let listeners = self.listeners.lock().clone();
            for listener in listeners {
                listener(&alert);
            }
        }
    }

    /// Health derived from events in the window ending now.
    pub fn health_status(&self) -> HealthReport {
        self.health_status_at(Utc::now())
    }

    /// Health derived from events in the window ending at `now`.
    pub fn health_status_at(&self, now: DateTime<Utc>) -> HealthReport {
        let config = self.config.read().clone();
        let since = now - Duration::seconds(config.window_seconds as i64);
        let mut state = self.state.lock();

        // Clear alerts whose condition no longer holds
        let cleared: Vec<(String, Severity)> = state
            .active
            .keys()
            .filter(|(component, severity)| {
                let count = state.history.get(component).map_or(0, |h| {
                    h.iter()
                        .filter(|e| e.severity == *severity && e.timestamp > since)
                        .count()
                });
                count < config.alert_threshold
            })
            .cloned()
            .collect();
        for key in cleared {
            state.retire(&key, config.history_capacity);
        }

        let mut events_in_window = 0;
        let mut warnings_or_worse = 0;
        let mut errors_or_worse = 0;
        let mut critical = false;
        let mut component_errors: BTreeMap<String, usize> = BTreeMap::new();

        for (component, history) in &state.history {
            for event in history.iter().filter(|e| e.timestamp > since && e.timestamp <= now) {
                events_in_window += 1;
                if event.severity >= Severity::Warning {
                    warnings_or_worse += 1;
                    *component_errors.entry(component.clone()).or_default() += 1;
                }
                if event.severity >= Severity::Error {
                    errors_or_worse += 1;
                }
                if event.severity == Severity::Critical {
                    critical = true;
                }
            }
        }

        let mut active_alerts: Vec<Alert> = state.active.values().cloned().collect();
        active_alerts.sort_by(|a, b| b.severity.cmp(&a.severity).then(a.first_seen.cmp(&b.first_seen)));

        let status = if critical {
            HealthStatus::Critical
        } else if errors_or_worse >= config.degraded_error_count
            || active_alerts.iter().any(|a| a.severity >= Severity::Error)
        {
            HealthStatus::Degraded
        } else if errors_or_worse > 0
            || warnings_or_worse >= config.warning_event_count
            || !active_alerts.is_empty()
        {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        };

        HealthReport {
            status,
            active_alerts,
            events_in_window,
            component_errors,
            last_event: state.last_event.clone(),
            generated_at: now,
        }
    }

    /// Events of one component, oldest first.
    pub fn history(&self, component: &str) -> Vec<ErrorEvent> {
        self.state
            .lock()
            .history
            .get(component)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Events about one context (usually a URL), oldest first.
    pub fn events_for(&self, context: &str) -> Vec<ErrorEvent> {
        let state = self.state.lock();
        let mut events: Vec<ErrorEvent> = state
            .history
            .values()
            .flat_map(|h| h.iter())
            .filter(|e| e.context.as_deref() == Some(context))
            .cloned()
            .collect();
        events.sort_by_key(|e| e.timestamp);
        events
    }

    /// Most recent events across components, newest first.
    pub fn recent(&self, limit: usize) -> Vec<ErrorEvent> {
        let state = self.state.lock();
        let mut events: Vec<ErrorEvent> = state
            .history
            .values()
            .flat_map(|h| h.iter())
            .cloned()
            .collect();
        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        events.truncate(limit);
        events
    }

    /// Alerts that have cleared, oldest first.
    pub fn resolved_alerts(&self) -> Vec<Alert> {
        self.state.lock().resolved.iter().cloned().collect()
    }

    /// Window length in use.
    pub fn window_seconds(&self) -> i64 {
        self.window().num_seconds()
    }

    /// Forget all events and alerts.
    pub fn clear(&self) {
        *self.state.lock() = MonitorState::default();
    }
}

impl Default for ErrorMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}
