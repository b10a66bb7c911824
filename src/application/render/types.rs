use std::time::Duration;

use thiserror::Error;

use super::{backoff::Backoff, breaker::BreakerConfig};

/// Failure of a render task, as surfaced to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("render timed out during {stage}")]
    Timeout { stage: &'static str },
    #[error("browser session crashed: {message}")]
    Crash { message: String },
    #[error("navigation failed: {message}")]
    Network { message: String },
    #[error("uncaught page script error: {message}")]
    JavaScript { message: String },
    #[error("render failed: {message}")]
    Unknown { message: String },
    #[error("render circuit breaker is open")]
    BreakerOpen,
    #[error("no render worker became available within {waited_ms} ms")]
    QueueTimeout { waited_ms: u64 },
}

impl RenderError {
    pub fn timeout(stage: &'static str) -> Self {
        Self::Timeout { stage }
    }

    pub fn crash(message: impl Into<String>) -> Self {
        Self::Crash {
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn javascript(message: impl Into<String>) -> Self {
        Self::JavaScript {
            message: message.into(),
        }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::Unknown {
            message: message.into(),
        }
    }

    /// Timeouts, crashes and network failures may succeed on another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RenderError::Timeout { .. } | RenderError::Crash { .. } | RenderError::Network { .. }
        )
    }

    /// The session that produced this error cannot be reused.
    pub fn poisons_session(&self) -> bool {
        matches!(self, RenderError::Timeout { .. } | RenderError::Crash { .. })
    }

    /// Whether the failure is charged to the circuit breaker.
    pub fn counts_against_breaker(&self) -> bool {
        !matches!(
            self,
            RenderError::BreakerOpen | RenderError::QueueTimeout { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RenderError::Timeout { .. } => "timeout",
            RenderError::Crash { .. } => "crash",
            RenderError::Network { .. } => "network",
            RenderError::JavaScript { .. } => "javascript",
            RenderError::Unknown { .. } => "unknown",
            RenderError::BreakerOpen => "breaker_open",
            RenderError::QueueTimeout { .. } => "queue_timeout",
        }
    }
}

/// Worker pool sizing, retry and timing parameters.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_concurrency: usize,
    /// Background renders admitted concurrently, on top of the pool bound.
    pub background_concurrency: usize,
    pub max_retries: u32,
    pub backoff: Backoff,
    /// Absolute budget of one task, retries included.
    pub task_deadline: Duration,
    /// Budget of each wait tier.
    pub wait_timeout: Duration,
    pub idle_quiet: Duration,
    pub dom_grace: Duration,
    /// Longest a task may wait for a worker.
    pub queue_timeout: Duration,
    pub breaker: BreakerConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            background_concurrency: 1,
            max_retries: 2,
            backoff: Backoff::default(),
            task_deadline: Duration::from_secs(45),
            wait_timeout: Duration::from_secs(10),
            idle_quiet: Duration::from_millis(500),
            dom_grace: Duration::from_secs(1),
            queue_timeout: Duration::from_secs(15),
            breaker: BreakerConfig::default(),
        }
    }
}

impl From<&crate::config::RenderSettings> for PoolConfig {
    fn from(settings: &crate::config::RenderSettings) -> Self {
        Self {
            max_concurrency: settings.max_concurrency.get(),
            background_concurrency: settings.background_concurrency.get(),
            max_retries: settings.max_retries,
            backoff: Backoff::new(settings.backoff, settings.backoff_base, settings.backoff_max),
            task_deadline: settings.task_deadline,
            wait_timeout: settings.wait_timeout,
            idle_quiet: settings.idle_quiet,
            dom_grace: settings.dom_grace,
            queue_timeout: settings.queue_timeout,
            breaker: BreakerConfig::from(&settings.breaker),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_taxonomy() {
        assert!(RenderError::timeout("navigate").is_retryable());
        assert!(RenderError::crash("gone").is_retryable());
        assert!(RenderError::network("reset").is_retryable());
        assert!(!RenderError::javascript("boom").is_retryable());
        assert!(!RenderError::unknown("?").is_retryable());
        assert!(!RenderError::BreakerOpen.is_retryable());
    }

    #[test]
    fn only_session_level_failures_poison_sessions() {
        assert!(RenderError::crash("gone").poisons_session());
        assert!(RenderError::timeout("wait").poisons_session());
        assert!(!RenderError::network("dns").poisons_session());
        assert!(!RenderError::javascript("boom").poisons_session());
    }

    #[test]
    fn capacity_errors_do_not_trip_the_breaker() {
        assert!(!RenderError::BreakerOpen.counts_against_breaker());
        assert!(!RenderError::QueueTimeout { waited_ms: 5 }.counts_against_breaker());
        assert!(RenderError::unknown("x").counts_against_breaker());
    }
}
