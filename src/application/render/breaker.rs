//! Circuit breaker guarding render submissions.
//!
//! ```text
//! Closed   -> Open:     error_threshold failures within monitoring_period
//! Open     -> HalfOpen: reset_timeout elapsed since opening
//! HalfOpen -> Closed:   half_open_max_calls probes succeeded
//! HalfOpen -> Open:     any probe failed
//! ```
//!
//! All state lives behind one mutex so every check-and-transition is atomic.

use std::{collections::VecDeque, sync::Mutex, time::Duration};

use metrics::{counter, gauge};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use super::types::RenderError;
use crate::cache::lock::mutex_lock;

const SOURCE: &str = "application::render::breaker";
const METRIC_BREAKER_STATE: &str = "prerender_breaker_state";
const METRIC_BREAKER_REJECTIONS: &str = "prerender_breaker_rejections_total";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    pub error_threshold: u32,
    pub monitoring_period: Duration,
    pub reset_timeout: Duration,
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            error_threshold: 5,
            monitoring_period: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
        }
    }
}

impl From<&crate::config::BreakerSettings> for BreakerConfig {
    fn from(settings: &crate::config::BreakerSettings) -> Self {
        Self {
            error_threshold: settings.error_threshold.get(),
            monitoring_period: settings.monitoring_period,
            reset_timeout: settings.reset_timeout,
            half_open_max_calls: settings.half_open_max_calls.get(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        }
    }

    fn gauge_value(self) -> f64 {
        match self {
            BreakerState::Closed => 0.0,
            BreakerState::Open => 1.0,
            BreakerState::HalfOpen => 2.0,
        }
    }
}

/// Point-in-time view of the breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    /// Failures inside the current monitoring window.
    pub recent_failures: u32,
    /// Time since the breaker last opened, while open or half-open.
    pub open_for_ms: Option<u64>,
    pub half_open_probes_in_flight: u32,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    probes_admitted: u32,
    probes_in_flight: u32,
    probes_succeeded: u32,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        gauge!(METRIC_BREAKER_STATE).set(BreakerState::Closed.gauge_value());
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                probes_admitted: 0,
                probes_in_flight: 0,
                probes_succeeded: 0,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        let mut inner = mutex_lock(&self.inner, SOURCE, "state");
        self.promote_if_due(&mut inner, Instant::now());
        inner.state
    }

    /// Admit one submission, or fail fast with [`RenderError::BreakerOpen`].
    /// The returned permit must be settled with the task's outcome.
    pub fn try_acquire(&self) -> Result<BreakerPermit<'_>, RenderError> {
        let mut inner = mutex_lock(&self.inner, SOURCE, "try_acquire");
        self.promote_if_due(&mut inner, Instant::now());

        match inner.state {
            BreakerState::Closed => Ok(BreakerPermit::new(self, false)),
            BreakerState::HalfOpen if inner.probes_admitted < self.config.half_open_max_calls => {
                inner.probes_admitted += 1;
                inner.probes_in_flight += 1;
                Ok(BreakerPermit::new(self, true))
            }
            BreakerState::Open | BreakerState::HalfOpen => {
                counter!(METRIC_BREAKER_REJECTIONS).increment(1);
                Err(RenderError::BreakerOpen)
            }
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = Instant::now();
        let mut inner = mutex_lock(&self.inner, SOURCE, "snapshot");
        self.promote_if_due(&mut inner, now);
        self.prune(&mut inner, now);
        BreakerSnapshot {
            state: inner.state,
            recent_failures: inner.failures.len() as u32,
            open_for_ms: inner
                .opened_at
                .map(|opened| now.saturating_duration_since(opened).as_millis() as u64),
            half_open_probes_in_flight: inner.probes_in_flight,
        }
    }

    fn record(&self, probe: bool, success: bool) {
        let now = Instant::now();
        let mut inner = mutex_lock(&self.inner, SOURCE, "record");

        if probe {
            inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
            if inner.state != BreakerState::HalfOpen {
                return;
            }
            if success {
                inner.probes_succeeded += 1;
                if inner.probes_succeeded >= self.config.half_open_max_calls {
                    self.transition(&mut inner, BreakerState::Closed, now);
                }
            } else {
                self.transition(&mut inner, BreakerState::Open, now);
            }
            return;
        }

        if inner.state != BreakerState::Closed {
            return;
        }
        if success {
            inner.failures.clear();
            return;
        }

        inner.failures.push_back(now);
        self.prune(&mut inner, now);
        if inner.failures.len() as u32 >= self.config.error_threshold {
            self.transition(&mut inner, BreakerState::Open, now);
        }
    }

    fn abandon(&self, probe: bool) {
        if !probe {
            return;
        }
        let mut inner = mutex_lock(&self.inner, SOURCE, "abandon");
        inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
        if inner.state == BreakerState::HalfOpen {
            inner.probes_admitted = inner.probes_admitted.saturating_sub(1);
        }
    }

    fn promote_if_due(&self, inner: &mut BreakerInner, now: Instant) {
        if inner.state != BreakerState::Open {
            return;
        }
        let due = inner
            .opened_at
            .is_none_or(|opened| now.saturating_duration_since(opened) >= self.config.reset_timeout);
        if due {
            self.transition(inner, BreakerState::HalfOpen, now);
        }
    }

    fn prune(&self, inner: &mut BreakerInner, now: Instant) {
        while let Some(oldest) = inner.failures.front() {
            if now.saturating_duration_since(*oldest) > self.config.monitoring_period {
                inner.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn transition(&self, inner: &mut BreakerInner, next: BreakerState, now: Instant) {
        let previous = inner.state;
        inner.state = next;
        inner.probes_admitted = 0;
        inner.probes_succeeded = 0;

        match next {
            BreakerState::Open => {
                inner.opened_at = Some(now);
                warn!(
                    target = "rendergate::render::breaker",
                    from = previous.as_str(),
                    to = next.as_str(),
                    recent_failures = inner.failures.len(),
                    reset_timeout_ms = self.config.reset_timeout.as_millis() as u64,
                    "Render circuit breaker opened"
                );
            }
            BreakerState::HalfOpen => {
                info!(
                    target = "rendergate::render::breaker",
                    from = previous.as_str(),
                    to = next.as_str(),
                    probes = self.config.half_open_max_calls,
                    "Render circuit breaker half-open"
                );
            }
            BreakerState::Closed => {
                inner.opened_at = None;
                inner.failures.clear();
                info!(
                    target = "rendergate::render::breaker",
                    from = previous.as_str(),
                    to = next.as_str(),
                    "Render circuit breaker closed"
                );
            }
        }
        gauge!(METRIC_BREAKER_STATE).set(next.gauge_value());
    }
}

/// Admission to submit one task. Dropping it unsettled releases a probe slot
/// without changing state.
#[must_use = "settle the permit with the task outcome"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl<'a> BreakerPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            settled: false,
        }
    }

    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record(self.probe, true);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record(self.probe, false);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.abandon(self.probe);
        }
    }
}
