mod support;

use std::collections::HashSet;

use metrics_util::debugging::DebuggingRecorder;
use rendergate::application::render::RenderError;
use support::{BROWSER, GOOGLEBOT, PageScript, get, harness};

#[tokio::test]
async fn request_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    let h = harness("");
    h.engine.script(
        "/broken",
        PageScript::Fail(RenderError::javascript("Evaluation failed")),
    );

    // miss + render, then hit
    h.orchestrator.handle(get("/pricing", GOOGLEBOT), None).await;
    h.orchestrator.handle(get("/pricing", GOOGLEBOT), None).await;
    // failed render
    h.orchestrator.handle(get("/broken", GOOGLEBOT), None).await;
    // passthrough
    h.orchestrator.handle(get("/pricing", BROWSER), None).await;

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "prerender_requests_total",
        "prerender_request_duration_seconds",
        "prerender_cache_hit_total",
        "prerender_cache_miss_total",
        "prerender_render_total",
        "prerender_render_duration_seconds",
        "prerender_interceptor_requests_total",
        "prerender_breaker_state",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
