//! Cache Store facade.
//!
//! Routes operations to the networked backend when one is configured and
//! healthy, and to the in-process backend otherwise. A networked failure is
//! logged, counted and absorbed: the operation is retried against the
//! in-process backend and the networked backend is skipped for the configured
//! retry window.

use std::{
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use metrics::counter;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{
    config::CacheConfig,
    entry::{CacheEntry, CacheLookup, CachedPage},
    error::CacheError,
    keys::CacheKey,
    lock::mutex_lock,
    memory::MemoryBackend,
    redis::{RedisBackend, redact_url},
};

const SOURCE: &str = "cache::store";
const METRIC_CACHE_HIT: &str = "prerender_cache_hit_total";
const METRIC_CACHE_MISS: &str = "prerender_cache_miss_total";
const METRIC_CACHE_STALE: &str = "prerender_cache_stale_total";
const METRIC_CACHE_BACKEND_FALLBACK: &str = "prerender_cache_backend_fallback_total";

/// Point-in-time counters reported by [`CacheStore::stats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stale: u64,
    pub size: usize,
    pub backend: &'static str,
}

pub struct CacheStore {
    config: CacheConfig,
    memory: MemoryBackend,
    redis: Option<RedisBackend>,
    degraded_until: Mutex<Option<Instant>>,
    hits: AtomicU64,
    misses: AtomicU64,
    stale: AtomicU64,
}

impl CacheStore {
    /// Store backed only by the in-process backend.
    pub fn in_memory(config: CacheConfig) -> Self {
        Self::with_backends(config, None)
    }

    /// Store preferring the networked backend when configured. An unreachable
    /// server at startup is logged and the store runs in-process only.
    pub async fn connect(config: CacheConfig) -> Self {
        let Some(url) = config.redis_url.clone().filter(|_| config.uses_redis()) else {
            return Self::in_memory(config);
        };

        match RedisBackend::connect(
            &url,
            config.redis_key_prefix.clone(),
            config.redis_connect_timeout(),
        )
        .await
        {
            Ok(backend) => Self::with_backends(config, Some(backend)),
            Err(err) => {
                warn!(
                    target = "rendergate::cache::store",
                    op = "connect",
                    result = "fallback",
                    url = %redact_url(&url),
                    error = %err,
                    "Networked cache unreachable; using in-process backend"
                );
                counter!(METRIC_CACHE_BACKEND_FALLBACK, "op" => "connect").increment(1);
                Self::in_memory(config)
            }
        }
    }

    fn with_backends(config: CacheConfig, redis: Option<RedisBackend>) -> Self {
        Self {
            memory: MemoryBackend::new(config.max_entries_non_zero()),
            config,
            redis,
            degraded_until: Mutex::new(None),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stale: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Name of the backend currently serving operations.
    pub fn backend_name(&self) -> &'static str {
        if self.active_redis().is_some() {
            "redis"
        } else {
            "memory"
        }
    }

    pub async fn get(&self, key: &CacheKey) -> CacheLookup {
        self.get_at(key, OffsetDateTime::now_utc()).await
    }

    pub async fn get_at(&self, key: &CacheKey, now: OffsetDateTime) -> CacheLookup {
        let lookup = self.lookup(key, now).await;
        match &lookup {
            CacheLookup::Fresh(_) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                counter!(METRIC_CACHE_HIT).increment(1);
            }
            CacheLookup::Stale(_) => {
                self.stale.fetch_add(1, Ordering::Relaxed);
                counter!(METRIC_CACHE_STALE).increment(1);
            }
            CacheLookup::Miss => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                counter!(METRIC_CACHE_MISS).increment(1);
            }
        }
        lookup
    }

    /// Lookup that leaves the hit, miss and stale counters untouched, for
    /// re-reading a key the caller already counted.
    pub async fn peek(&self, key: &CacheKey) -> CacheLookup {
        self.lookup(key, OffsetDateTime::now_utc()).await
    }

    async fn lookup(&self, key: &CacheKey, now: OffsetDateTime) -> CacheLookup {
        match self.active_redis() {
            Some(redis) => match redis.get(key, now).await {
                Ok(lookup) => lookup,
                Err(err) => {
                    self.degrade("get", &err);
                    self.memory.get_at(key, now)
                }
            },
            None => self.memory.get_at(key, now),
        }
    }

    /// Store a page fresh for `ttl`, servable stale for the configured window after.
    pub async fn set(&self, key: &CacheKey, page: CachedPage, ttl: Duration) {
        self.set_at(key, page, ttl, OffsetDateTime::now_utc()).await;
    }

    pub async fn set_at(&self, key: &CacheKey, page: CachedPage, ttl: Duration, now: OffsetDateTime) {
        let entry = CacheEntry::new(key.clone(), page, ttl, self.config.stale_window(), now);

        if let Some(redis) = self.active_redis() {
            match redis.put(&entry, now).await {
                Ok(()) => return,
                Err(err) => self.degrade("set", &err),
            }
        }

        if let Some(evicted) = self.memory.put(entry) {
            debug!(
                target = "rendergate::cache::store",
                op = "evict",
                key = %key,
                evicted = %evicted,
                "Cache entry evicted"
            );
        }
    }

    /// Remove one entry from every backend. Returns true when something was removed.
    pub async fn delete(&self, key: &CacheKey) -> bool {
        let mut removed = self.memory.remove(key);
        if let Some(redis) = self.active_redis() {
            match redis.remove(key).await {
                Ok(found) => removed |= found,
                Err(err) => self.degrade("delete", &err),
            }
        }
        removed
    }

    /// Remove every entry whose key matches the glob `pattern` from every
    /// backend, returning the total removed.
    pub async fn delete_by_pattern(&self, pattern: &str) -> u64 {
        let mut removed = self.memory.remove_matching(pattern);
        if let Some(redis) = self.active_redis() {
            match redis.remove_matching(pattern).await {
                Ok(count) => removed += count,
                Err(err) => self.degrade("delete_by_pattern", &err),
            }
        }
        removed
    }

    pub async fn stats(&self) -> CacheStats {
        let backend = self.backend_name();
        let size = match self.active_redis() {
            Some(redis) => match redis.len().await {
                Ok(size) => size,
                Err(err) => {
                    self.degrade("stats", &err);
                    self.memory.len()
                }
            },
            None => self.memory.len(),
        };

        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            size,
            backend,
        }
    }

    /// Purge hard-expired entries from the in-process backend. The networked
    /// backend expires entries natively.
    pub fn sweep(&self) -> usize {
        self.sweep_at(OffsetDateTime::now_utc())
    }

    pub fn sweep_at(&self, now: OffsetDateTime) -> usize {
        self.memory.sweep_at(now)
    }

    fn active_redis(&self) -> Option<&RedisBackend> {
        let redis = self.redis.as_ref()?;
        let mut degraded = mutex_lock(&self.degraded_until, SOURCE, "active_redis");
        match *degraded {
            Some(until) if Instant::now() < until => None,
            Some(_) => {
                *degraded = None;
                debug!(
                    target = "rendergate::cache::store",
                    op = "recover",
                    "Retrying networked cache backend"
                );
                Some(redis)
            }
            None => Some(redis),
        }
    }

    fn degrade(&self, op: &'static str, err: &CacheError) {
        let retry = self.config.redis_retry();
        *mutex_lock(&self.degraded_until, SOURCE, "degrade") = Some(Instant::now() + retry);
        counter!(METRIC_CACHE_BACKEND_FALLBACK, "op" => op).increment(1);
        warn!(
            target = "rendergate::cache::store",
            op,
            result = "fallback",
            retry_after_ms = retry.as_millis() as u64,
            error = %err,
            "Networked cache operation failed; using in-process backend"
        );
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    const NOW: OffsetDateTime = datetime!(2024-05-01 12:00 UTC);

    fn store(max_entries: usize) -> CacheStore {
        CacheStore::in_memory(CacheConfig {
            max_entries,
            stale_window_seconds: 30,
            ..Default::default()
        })
    }

    fn key(path: &str) -> CacheKey {
        CacheKey::for_request("example.com", path).expect("key")
    }

    fn page(body: &str) -> CachedPage {
        CachedPage {
            html: body.to_string(),
            status_code: 200,
            headers: Vec::new(),
        }
    }

    #[tokio::test]
    async fn round_trip_is_byte_identical_within_ttl() {
        let store = store(8);
        let html = "<html><body>caf\u{e9} \u{1f600}</body></html>";
        store
            .set_at(&key("/p"), page(html), Duration::from_secs(60), NOW)
            .await;

        match store.get_at(&key("/p"), NOW + Duration::from_secs(1)).await {
            CacheLookup::Fresh(entry) => {
                assert_eq!(entry.html, html);
                assert_eq!(entry.status_code, 200);
            }
            other => panic!("expected fresh, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stats_count_each_lookup_outcome() {
        let store = store(8);
        store
            .set_at(&key("/p"), page("x"), Duration::from_secs(60), NOW)
            .await;

        store.get_at(&key("/p"), NOW).await;
        store.get_at(&key("/p"), NOW + Duration::from_secs(70)).await;
        store.get_at(&key("/missing"), NOW).await;
        store.get_at(&key("/p"), NOW + Duration::from_secs(200)).await;

        let stats = store.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.stale, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.size, 0, "hard-expired entry dropped on read");
        assert_eq!(stats.backend, "memory");
    }

    #[tokio::test]
    async fn peek_reads_without_counting() {
        let store = store(8);
        store.set(&key("/p"), page("x"), Duration::from_secs(60)).await;

        assert!(matches!(store.peek(&key("/p")).await, CacheLookup::Fresh(_)));
        assert!(matches!(store.peek(&key("/missing")).await, CacheLookup::Miss));

        let stats = store.stats().await;
        assert_eq!((stats.hits, stats.misses, stats.stale), (0, 0, 0));
    }

    #[tokio::test]
    async fn delete_and_pattern_delete() {
        let store = store(8);
        for path in ["/a", "/blog/1", "/blog/2"] {
            store
                .set_at(&key(path), page(path), Duration::from_secs(60), NOW)
                .await;
        }

        assert!(store.delete(&key("/a")).await);
        assert!(!store.delete(&key("/a")).await);
        assert_eq!(store.delete_by_pattern("example.com/blog/*").await, 2);
        assert_eq!(store.stats().await.size, 0);
    }

    #[tokio::test]
    async fn sweep_removes_only_hard_expired() {
        let store = store(8);
        store
            .set_at(&key("/short"), page("s"), Duration::from_secs(1), NOW)
            .await;
        store
            .set_at(&key("/long"), page("l"), Duration::from_secs(600), NOW)
            .await;

        assert_eq!(store.sweep_at(NOW + Duration::from_secs(10)), 0, "still stale");
        assert_eq!(store.sweep_at(NOW + Duration::from_secs(40)), 1);
        assert_eq!(store.stats().await.size, 1);
    }

    #[tokio::test]
    async fn unreachable_network_backend_falls_back_to_memory() {
        let store = CacheStore::connect(CacheConfig {
            redis_url: Some("redis://127.0.0.1:1".to_string()),
            redis_connect_timeout_ms: 300,
            ..Default::default()
        })
        .await;

        assert_eq!(store.backend_name(), "memory");
        store.set(&key("/p"), page("x"), Duration::from_secs(60)).await;
        assert!(matches!(store.get(&key("/p")).await, CacheLookup::Fresh(_)));
    }
}
