mod support;

use std::time::Duration;

use axum::http::StatusCode;
use futures::future::join_all;
use rendergate::{
    application::render::{BreakerState, RenderError},
    cache::{CacheKey, CacheLookup, CachedPage},
};
use support::{BROWSER, GOOGLEBOT, PageScript, body_text, get, harness, header};
use time::OffsetDateTime;
use url::Url;

const POLICY: &str = r#"
[[cache_rules]]
id = "checkout"
pattern = "/checkout*"
scope = "no-cache"
priority = 100

[[bot_rules]]
id = "evil"
type = "user-agent"
pattern = "evilbot"
action = "block"
priority = 50

[[bot_rules]]
id = "scrapers"
type = "user-agent"
pattern = "scrapy"
action = "challenge"
priority = 40
"#;

fn public_key(path: &str) -> CacheKey {
    let url = Url::parse(&format!("http://www.example.com{path}")).expect("public url");
    CacheKey::from_url(&url)
}

#[tokio::test]
async fn bot_miss_renders_then_serves_fresh_copy() {
    let h = harness(POLICY);
    h.engine.script(
        "/pricing",
        PageScript::html("<html><body><h1>Pricing</h1></body></html>"),
    );

    let first = h.orchestrator.handle(get("/pricing", GOOGLEBOT), None).await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(header(&first, "x-prerender-cache"), Some("miss"));
    assert_eq!(header(&first, "x-prerender-outcome"), Some("render"));
    assert_eq!(header(&first, "x-prerender-rule"), Some("default"));
    assert!(body_text(first).await.contains("<h1>Pricing</h1>"));

    let second = h.orchestrator.handle(get("/pricing", GOOGLEBOT), None).await;
    assert_eq!(header(&second, "x-prerender-cache"), Some("fresh"));
    assert!(body_text(second).await.contains("<h1>Pricing</h1>"));

    assert_eq!(h.engine.renders(), 1);
    assert_eq!(h.origin.hits(), 0);
    assert_eq!(
        h.engine.rendered_urls(),
        vec!["http://origin.internal:8080/pricing".to_string()]
    );
}

#[tokio::test]
async fn human_traffic_passes_through_untouched() {
    let h = harness(POLICY);

    let response = h.orchestrator.handle(get("/pricing?plan=pro", BROWSER), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "x-prerender-outcome"), Some("proxy"));
    assert_eq!(header(&response, "x-origin"), Some("1"));
    assert_eq!(header(&response, "x-prerender-cache"), None);
    assert_eq!(body_text(response).await, "origin:/pricing?plan=pro");

    assert_eq!(h.engine.renders(), 0);
}

#[tokio::test]
async fn static_assets_and_non_get_requests_are_never_rendered() {
    let h = harness(POLICY);

    let asset = h.orchestrator.handle(get("/static/app.js", GOOGLEBOT), None).await;
    assert_eq!(header(&asset, "x-prerender-outcome"), Some("proxy"));

    let mut post = get("/contact", GOOGLEBOT);
    *post.method_mut() = axum::http::Method::POST;
    let posted = h.orchestrator.handle(post, None).await;
    assert_eq!(header(&posted, "x-prerender-outcome"), Some("proxy"));

    assert_eq!(h.engine.renders(), 0);
    assert_eq!(h.origin.hits(), 2);
}

#[tokio::test]
async fn no_cache_rule_bypasses_render() {
    let h = harness(POLICY);

    let response = h
        .orchestrator
        .handle(get("/checkout/step-1", GOOGLEBOT), None)
        .await;
    assert_eq!(header(&response, "x-prerender-outcome"), Some("proxy"));
    assert_eq!(header(&response, "x-prerender-rule"), Some("checkout"));
    assert_eq!(h.engine.renders(), 0);
    assert_eq!(h.origin.hits(), 1);
}

#[tokio::test]
async fn meta_marker_keeps_page_out_of_cache() {
    let h = harness(POLICY);
    h.engine.script(
        "/news",
        PageScript::html(
            r#"<html><head><meta name="x-cache" content="false"></head><body>today</body></html>"#,
        ),
    );

    for _ in 0..2 {
        let response = h.orchestrator.handle(get("/news", GOOGLEBOT), None).await;
        assert_eq!(header(&response, "x-prerender-cache"), Some("miss"));
        assert!(body_text(response).await.contains("today"));
    }

    assert_eq!(h.engine.renders(), 2);
    assert!(matches!(
        h.cache.get(&public_key("/news")).await,
        CacheLookup::Miss
    ));
}

#[tokio::test]
async fn non_success_render_is_served_but_not_stored() {
    let h = harness(POLICY);
    h.engine.script(
        "/gone",
        PageScript::Html {
            html: "<html><body>not here</body></html>".to_string(),
            status: 404,
        },
    );

    let response = h.orchestrator.handle(get("/gone", GOOGLEBOT), None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(header(&response, "x-prerender-outcome"), Some("render"));
    assert!(matches!(
        h.cache.get(&public_key("/gone")).await,
        CacheLookup::Miss
    ));
}

#[tokio::test]
async fn concurrent_misses_share_one_render() {
    let h = harness(POLICY);
    h.engine.set_delay(Duration::from_millis(200));

    let requests = (0..6).map(|_| {
        let orchestrator = h.orchestrator.clone();
        async move { orchestrator.handle(get("/landing", GOOGLEBOT), None).await }
    });
    let responses = join_all(requests).await;

    for response in responses {
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, "x-prerender-outcome"), Some("render"));
    }
    assert_eq!(h.engine.renders(), 1);
    assert!(h.orchestrator.flights().is_empty());
}

#[tokio::test]
async fn failed_render_falls_back_to_origin() {
    let h = harness(POLICY);
    h.engine.script(
        "/broken",
        PageScript::Fail(RenderError::javascript("ReferenceError: app is not defined")),
    );

    let response = h.orchestrator.handle(get("/broken", GOOGLEBOT), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "x-prerender-cache"), Some("miss"));
    assert_eq!(header(&response, "x-prerender-outcome"), Some("proxy"));
    assert_eq!(body_text(response).await, "origin:/broken");
}

#[tokio::test]
async fn failed_render_with_unreachable_origin_is_internal_error() {
    let h = harness(POLICY);
    h.engine
        .fail_everything(RenderError::javascript("Evaluation failed"));
    h.origin.fail_next(2);

    let response = h.orchestrator.handle(get("/broken", GOOGLEBOT), None).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(h.origin.hits(), 2);
}

#[tokio::test]
async fn open_breaker_sends_bots_to_origin() {
    let h = harness(POLICY);
    h.engine
        .fail_everything(RenderError::javascript("Evaluation failed"));

    for path in ["/a", "/b"] {
        let response = h.orchestrator.handle(get(path, GOOGLEBOT), None).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert_eq!(h.pool.breaker().state(), BreakerState::Open);

    let response = h.orchestrator.handle(get("/c", GOOGLEBOT), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "origin:/c");
    assert_eq!(h.engine.renders(), 2);
}

#[tokio::test]
async fn stale_entry_is_served_and_refreshed_in_background() {
    let h = harness(POLICY);
    h.engine.script(
        "/docs",
        PageScript::html("<html><body>new docs</body></html>"),
    );
    let key = public_key("/docs");
    let written = OffsetDateTime::now_utc() - time::Duration::seconds(120);
    h.cache
        .set_at(
            &key,
            CachedPage {
                html: "<html><body>old docs</body></html>".to_string(),
                status_code: 200,
                headers: Vec::new(),
            },
            Duration::from_secs(60),
            written,
        )
        .await;

    let response = h.orchestrator.handle(get("/docs", GOOGLEBOT), None).await;
    assert_eq!(header(&response, "x-prerender-cache"), Some("stale"));
    assert!(body_text(response).await.contains("old docs"));

    let mut refreshed = None;
    for _ in 0..80 {
        if let CacheLookup::Fresh(entry) = h.cache.get(&key).await {
            refreshed = Some(entry);
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    let entry = refreshed.expect("background refresh stores a fresh entry");
    assert!(entry.html.contains("new docs"));
    assert_eq!(h.engine.renders(), 1);
}

#[tokio::test]
async fn block_rule_refuses_request() {
    let h = harness(POLICY);

    let response = h
        .orchestrator
        .handle(get("/pricing", "EvilBot/3.1 (+http://evil.test)"), None)
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(h.origin.hits(), 0);
    assert_eq!(h.engine.renders(), 0);
}

#[tokio::test]
async fn challenge_rule_flags_origin_request() {
    let h = harness(POLICY);

    let response = h
        .orchestrator
        .handle(get("/pricing", "Scrapy/2.11 (+https://scrapy.org)"), None)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "x-prerender-outcome"), Some("proxy"));

    let forwarded = h.origin.requests();
    assert_eq!(forwarded.len(), 1);
    assert_eq!(
        forwarded[0]
            .headers
            .get("x-prerender-challenge")
            .and_then(|value| value.to_str().ok()),
        Some("1")
    );
    assert_eq!(h.engine.renders(), 0);
}

#[tokio::test]
async fn warm_stores_page_for_later_bots() {
    let h = harness(POLICY);
    h.engine.script(
        "/blog",
        PageScript::html("<html><body>warm</body></html>"),
    );

    let url = Url::parse("http://www.example.com/blog").expect("url");
    h.orchestrator.warm(url).await;

    let response = h.orchestrator.handle(get("/blog", GOOGLEBOT), None).await;
    assert_eq!(header(&response, "x-prerender-cache"), Some("fresh"));
    assert_eq!(h.engine.renders(), 1);
}
