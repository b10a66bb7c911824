//! Bounded in-process backend.
//!
//! Entries are evicted in insertion order once the cap is reached: reads use
//! `peek` so they never reorder the underlying list. Every operation takes
//! the lock once, so a reader observes either the whole entry or a miss.

use std::{num::NonZeroUsize, sync::RwLock};

use lru::LruCache;
use metrics::counter;
use time::OffsetDateTime;

use super::{
    entry::{CacheEntry, CacheLookup, Freshness},
    keys::{CacheKey, glob_match},
    lock::{rw_read, rw_write},
};

const SOURCE: &str = "cache::memory";
const METRIC_CACHE_EVICT: &str = "prerender_cache_evict_total";
const METRIC_CACHE_EXPIRED: &str = "prerender_cache_expired_total";

pub struct MemoryBackend {
    entries: RwLock<LruCache<CacheKey, CacheEntry>>,
}

impl MemoryBackend {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: RwLock::new(LruCache::new(capacity)),
        }
    }

    /// Look up an entry as of `now`, dropping it if it is past hard expiry.
    pub fn get_at(&self, key: &CacheKey, now: OffsetDateTime) -> CacheLookup {
        let mut entries = rw_write(&self.entries, SOURCE, "get");
        let freshness = match entries.peek(key) {
            Some(entry) => entry.freshness(now),
            None => return CacheLookup::Miss,
        };

        if freshness == Freshness::Expired {
            entries.pop(key);
            counter!(METRIC_CACHE_EXPIRED, "reason" => "lazy").increment(1);
            return CacheLookup::Miss;
        }

        match entries.peek_mut(key) {
            Some(entry) => {
                entry.hit_count += 1;
                CacheLookup::classify(entry.clone(), now)
            }
            None => CacheLookup::Miss,
        }
    }

    /// Insert or replace an entry, returning the key evicted to make room.
    pub fn put(&self, entry: CacheEntry) -> Option<CacheKey> {
        let key = entry.key.clone();
        let evicted = rw_write(&self.entries, SOURCE, "put")
            .push(key.clone(), entry)
            .map(|(evicted_key, _)| evicted_key)
            .filter(|evicted_key| *evicted_key != key);

        if evicted.is_some() {
            counter!(METRIC_CACHE_EVICT).increment(1);
        }
        evicted
    }

    pub fn remove(&self, key: &CacheKey) -> bool {
        rw_write(&self.entries, SOURCE, "remove").pop(key).is_some()
    }

    pub fn remove_matching(&self, pattern: &str) -> u64 {
        let mut entries = rw_write(&self.entries, SOURCE, "remove_matching");
        let matching: Vec<CacheKey> = entries
            .iter()
            .filter(|(key, _)| glob_match(pattern, key.as_str()))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &matching {
            entries.pop(key);
        }
        matching.len() as u64
    }

    /// Drop every entry past hard expiry as of `now`.
    pub fn sweep_at(&self, now: OffsetDateTime) -> usize {
        let mut entries = rw_write(&self.entries, SOURCE, "sweep");
        let expired: Vec<CacheKey> = entries
            .iter()
            .filter(|(_, entry)| entry.freshness(now) == Freshness::Expired)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        if !expired.is_empty() {
            counter!(METRIC_CACHE_EXPIRED, "reason" => "sweep").increment(expired.len() as u64);
        }
        expired.len()
    }

    pub fn clear(&self) {
        rw_write(&self.entries, SOURCE, "clear").clear();
    }

    /// Get the number of stored entries, including ones not yet swept.
    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
    }

    /// Check if the backend is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::{
        panic::{AssertUnwindSafe, catch_unwind},
        time::Duration,
    };

    use time::macros::datetime;

    use super::*;
    use crate::cache::entry::CachedPage;

    const NOW: OffsetDateTime = datetime!(2024-05-01 12:00 UTC);

    fn key(path: &str) -> CacheKey {
        CacheKey::for_request("example.com", path).expect("key")
    }

    fn entry(path: &str, ttl: u64, stale: u64) -> CacheEntry {
        CacheEntry::new(
            key(path),
            CachedPage {
                html: format!("<html>{path}</html>"),
                status_code: 200,
                headers: vec![("content-type".to_string(), "text/html".to_string())],
            },
            Duration::from_secs(ttl),
            Duration::from_secs(stale),
            NOW,
        )
    }

    fn backend(capacity: usize) -> MemoryBackend {
        MemoryBackend::new(NonZeroUsize::new(capacity).expect("non-zero"))
    }

    #[test]
    fn stored_entry_round_trips_within_ttl() {
        let store = backend(4);
        store.put(entry("/a", 60, 0));

        match store.get_at(&key("/a"), NOW + Duration::from_secs(59)) {
            CacheLookup::Fresh(found) => {
                assert_eq!(found.html, "<html>/a</html>");
                assert_eq!(found.status_code, 200);
                assert_eq!(found.hit_count, 1);
            }
            other => panic!("expected fresh entry, got {other:?}"),
        }
    }

    #[test]
    fn stale_window_is_reported_distinctly() {
        let store = backend(4);
        store.put(entry("/a", 60, 30));

        assert!(matches!(
            store.get_at(&key("/a"), NOW + Duration::from_secs(75)),
            CacheLookup::Stale(_)
        ));
    }

    #[test]
    fn never_returns_entry_after_hard_expiry() {
        let store = backend(4);
        store.put(entry("/a", 60, 30));

        assert_eq!(
            store.get_at(&key("/a"), NOW + Duration::from_secs(91)),
            CacheLookup::Miss
        );
        assert!(store.is_empty(), "expired entry is dropped on read");
    }

    #[test]
    fn eviction_follows_insertion_order_not_reads() {
        let store = backend(2);
        store.put(entry("/a", 60, 0));
        store.put(entry("/b", 60, 0));

        // Reading /a must not protect it from eviction.
        assert!(matches!(store.get_at(&key("/a"), NOW), CacheLookup::Fresh(_)));

        let evicted = store.put(entry("/c", 60, 0));
        assert_eq!(evicted, Some(key("/a")));
        assert_eq!(store.get_at(&key("/a"), NOW), CacheLookup::Miss);
        assert!(matches!(store.get_at(&key("/b"), NOW), CacheLookup::Fresh(_)));
    }

    #[test]
    fn replacing_a_key_is_not_an_eviction() {
        let store = backend(2);
        store.put(entry("/a", 60, 0));
        assert_eq!(store.put(entry("/a", 120, 0)), None);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn pattern_delete_and_sweep() {
        let store = backend(8);
        store.put(entry("/blog/one", 60, 0));
        store.put(entry("/blog/two", 60, 0));
        store.put(entry("/shop", 1, 0));

        assert_eq!(store.remove_matching("example.com/blog/*"), 2);
        assert_eq!(store.len(), 1);

        assert_eq!(store.sweep_at(NOW + Duration::from_secs(5)), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn backend_recovers_from_poisoned_lock() {
        let store = backend(2);

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = store
                .entries
                .write()
                .expect("entries lock should be acquired");
            panic!("poison entries lock");
        }));

        store.put(entry("/a", 60, 0));
        assert_eq!(store.len(), 1);
    }
}
