//! Cache configuration.
//!
//! Controls the in-process backend, expiry windows and the optional networked
//! backend via the `[cache]` section of `rendergate.toml`.

use std::{num::NonZeroUsize, time::Duration};

use serde::Deserialize;

// Default values for cache configuration
const DEFAULT_MAX_ENTRIES: usize = 1000;
const DEFAULT_TTL_SECS: u64 = 86_400;
const DEFAULT_STALE_WINDOW_SECS: u64 = 3_600;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
const DEFAULT_REDIS_KEY_PREFIX: &str = "prerender:";
const DEFAULT_REDIS_RETRY_SECS: u64 = 30;
const DEFAULT_REDIS_CONNECT_TIMEOUT_MS: u64 = 2_000;

/// Cache configuration from `rendergate.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum entries held by the in-process backend.
    pub max_entries: usize,
    /// Default time an entry stays fresh.
    pub ttl_seconds: u64,
    /// Additional time a softly-expired entry may still be served.
    pub stale_window_seconds: u64,
    /// Interval between active sweeps of hard-expired entries.
    pub sweep_interval_seconds: u64,
    /// Networked backend; the in-process backend is used when absent.
    pub redis_url: Option<String>,
    pub redis_key_prefix: String,
    /// How long operations stay on the in-process backend after a networked failure.
    pub redis_retry_seconds: u64,
    pub redis_connect_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            ttl_seconds: DEFAULT_TTL_SECS,
            stale_window_seconds: DEFAULT_STALE_WINDOW_SECS,
            sweep_interval_seconds: DEFAULT_SWEEP_INTERVAL_SECS,
            redis_url: None,
            redis_key_prefix: DEFAULT_REDIS_KEY_PREFIX.to_string(),
            redis_retry_seconds: DEFAULT_REDIS_RETRY_SECS,
            redis_connect_timeout_ms: DEFAULT_REDIS_CONNECT_TIMEOUT_MS,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            max_entries: settings.max_entries.get(),
            ttl_seconds: settings.ttl.as_secs(),
            stale_window_seconds: settings.stale_window.as_secs(),
            sweep_interval_seconds: settings.sweep_interval.as_secs(),
            redis_url: settings.redis_url.clone(),
            redis_key_prefix: settings.redis_key_prefix.clone(),
            redis_retry_seconds: settings.redis_retry.as_secs(),
            redis_connect_timeout_ms: settings.redis_connect_timeout.as_millis() as u64,
        }
    }
}

impl CacheConfig {
    /// Returns the entry limit as NonZeroUsize, clamping to 1 if zero.
    pub fn max_entries_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_entries).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn stale_window(&self) -> Duration {
        Duration::from_secs(self.stale_window_seconds)
    }

    /// Sweep interval, clamped to at least one second.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds.max(1))
    }

    pub fn redis_retry(&self) -> Duration {
        Duration::from_secs(self.redis_retry_seconds)
    }

    pub fn redis_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.redis_connect_timeout_ms)
    }

    /// Returns true when a networked backend is configured.
    pub fn uses_redis(&self) -> bool {
        self.redis_url
            .as_deref()
            .is_some_and(|url| !url.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert_eq!(config.max_entries, 1000);
        assert_eq!(config.ttl(), Duration::from_secs(86_400));
        assert_eq!(config.stale_window(), Duration::from_secs(3_600));
        assert_eq!(config.redis_key_prefix, "prerender:");
        assert!(!config.uses_redis());
    }

    #[test]
    fn zero_limits_are_clamped() {
        let config = CacheConfig {
            max_entries: 0,
            sweep_interval_seconds: 0,
            ..Default::default()
        };
        assert_eq!(config.max_entries_non_zero().get(), 1);
        assert_eq!(config.sweep_interval(), Duration::from_secs(1));
    }

    #[test]
    fn blank_redis_url_is_ignored() {
        let config = CacheConfig {
            redis_url: Some("  ".to_string()),
            ..Default::default()
        };
        assert!(!config.uses_redis());
    }

    #[test]
    fn deserialize_with_partial_fields() {
        let config: CacheConfig = toml::from_str(
            r#"
            max_entries = 10
            redis_url = "redis://localhost:6379"
            "#,
        )
        .expect("deserialize");
        assert_eq!(config.max_entries, 10);
        assert_eq!(config.ttl_seconds, 86_400);
        assert!(config.uses_redis());
    }
}
