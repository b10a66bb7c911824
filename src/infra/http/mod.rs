//! Inbound HTTP surface: diagnostics under `/_prerender/`, everything else
//! through the orchestrator.

mod middleware;

use std::net::SocketAddr;

use axum::{
    Json, Router,
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware as axum_middleware,
    response::{IntoResponse, Response},
    routing::{any, get},
};
use serde::Serialize;

use crate::{
    application::{
        orchestrator::Orchestrator,
        render::{BreakerState, PoolStats},
    },
    cache::CacheStats,
};

pub use middleware::{RequestContext, log_responses, set_request_context};

#[derive(Clone)]
pub struct HttpState {
    pub orchestrator: Orchestrator,
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/_prerender/health", get(health))
        .route("/_prerender/stats", get(stats))
        .route("/_prerender/{*rest}", any(reserved))
        .fallback(proxy)
        .with_state(state)
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_context))
}

async fn reserved() -> StatusCode {
    StatusCode::NOT_FOUND
}

async fn proxy(State(state): State<HttpState>, request: Request) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    state.orchestrator.handle(request, peer).await
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    breaker: BreakerState,
    cache_backend: &'static str,
}

/// Reports `degraded` with a 503 while the breaker is open; requests are
/// still served by passthrough in that state.
async fn health(State(state): State<HttpState>) -> Response {
    let breaker = state.orchestrator.pool().breaker().snapshot().state;
    let (status, label) = match breaker {
        BreakerState::Open => (StatusCode::SERVICE_UNAVAILABLE, "degraded"),
        BreakerState::Closed | BreakerState::HalfOpen => (StatusCode::OK, "ok"),
    };
    let body = HealthBody {
        status: label,
        breaker,
        cache_backend: state.orchestrator.cache().backend_name(),
    };
    (status, Json(body)).into_response()
}

#[derive(Debug, Serialize)]
struct StatsBody {
    cache: CacheStats,
    pool: PoolStats,
    in_flight: usize,
    policy: PolicyCounts,
}

#[derive(Debug, Serialize)]
struct PolicyCounts {
    cache_rules: usize,
    bot_rules: usize,
    block_rules: usize,
    skipped_rules: usize,
}

async fn stats(State(state): State<HttpState>) -> Json<StatsBody> {
    let orchestrator = &state.orchestrator;
    let snapshot = orchestrator.policy().current();
    let (cache_rules, bot_rules, block_rules) = snapshot.rule_counts();

    Json(StatsBody {
        cache: orchestrator.cache().stats().await,
        pool: orchestrator.pool().stats(),
        in_flight: orchestrator.flights().len(),
        policy: PolicyCounts {
            cache_rules,
            bot_rules,
            block_rules,
            skipped_rules: snapshot.skipped.len(),
        },
    })
}
