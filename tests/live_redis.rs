//! Networked cache backend tests against a running Redis server.
//!
//! - Marked `#[ignore]`; run with `cargo test -- --ignored` once a server is up.
//! - Reads the server address from `RENDERGATE_TEST_REDIS_URL`
//!   (default `redis://127.0.0.1:6379`).
//! - Every test writes under its own key prefix and cleans up after itself.

use std::time::Duration;

use rendergate::cache::{CacheConfig, CacheKey, CacheLookup, CacheStore, CachedPage};
use url::Url;
use uuid::Uuid;

fn redis_config(prefix: &str) -> CacheConfig {
    CacheConfig {
        redis_url: Some(
            std::env::var("RENDERGATE_TEST_REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
        ),
        redis_key_prefix: prefix.to_string(),
        ..CacheConfig::default()
    }
}

fn unique_prefix() -> String {
    format!("rendergate-test:{}:", Uuid::new_v4().simple())
}

fn key(path: &str) -> CacheKey {
    CacheKey::from_url(&Url::parse(&format!("https://shop.example.com{path}")).expect("url"))
}

fn page(body: &str) -> CachedPage {
    CachedPage {
        html: format!("<html><body>{body}</body></html>"),
        status_code: 200,
        headers: vec![("content-type".to_string(), "text/html; charset=utf-8".to_string())],
    }
}

#[tokio::test]
#[ignore]
async fn live_redis_entries_are_shared_between_instances() {
    let prefix = unique_prefix();
    let writer = CacheStore::connect(redis_config(&prefix)).await;
    let reader = CacheStore::connect(redis_config(&prefix)).await;
    assert_eq!(writer.backend_name(), "redis");
    assert_eq!(reader.backend_name(), "redis");

    writer
        .set(&key("/products/42"), page("shared"), Duration::from_secs(60))
        .await;

    match reader.get(&key("/products/42")).await {
        CacheLookup::Fresh(entry) => {
            assert_eq!(entry.html, page("shared").html);
            assert_eq!(entry.status_code, 200);
        }
        other => panic!("expected fresh entry, got {other:?}"),
    }

    writer.delete_by_pattern("*").await;
}

#[tokio::test]
#[ignore]
async fn live_redis_pattern_delete_only_touches_matches() {
    let prefix = unique_prefix();
    let store = CacheStore::connect(redis_config(&prefix)).await;

    for path in ["/blog/a", "/blog/b", "/pricing"] {
        store
            .set(&key(path), page(path), Duration::from_secs(60))
            .await;
    }

    let removed = store.delete_by_pattern("shop.example.com/blog/*").await;
    assert_eq!(removed, 2);
    assert!(matches!(store.get(&key("/blog/a")).await, CacheLookup::Miss));
    assert!(matches!(
        store.get(&key("/pricing")).await,
        CacheLookup::Fresh(_)
    ));
    assert_eq!(store.stats().await.size, 1);

    store.delete_by_pattern("*").await;
}
