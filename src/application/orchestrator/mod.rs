//! Render Orchestrator: the end-to-end request flow.
//!
//! ```text
//! Classify -> static / human / allow        -> passthrough
//!          -> block                         -> 403
//!          -> challenge                     -> passthrough + challenge header
//!          -> bot -> Decide -> bypass       -> passthrough
//!                           -> lookup fresh -> serve
//!                                     stale -> serve, refresh in background
//!                                     miss  -> single-flight render
//!                                              -> ok: decide again, maybe store, serve
//!                                              -> failed: passthrough fallback
//! ```
//!
//! Every render-path failure degrades into a passthrough; only an origin that
//! cannot be reached twice in a row surfaces as a 500.

mod flights;
mod outcome;
mod upstream;

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    body::{Body, to_bytes},
    extract::Request,
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
};
use metrics::counter;
use tracing::{debug, warn};
use url::Url;

use crate::{
    application::{
        classifier::RequestClassifier,
        decision::decide,
        error::HttpError,
        policy::{PolicyHandle, PolicySnapshot},
        render::{RenderError, RenderPool},
    },
    cache::{CacheKey, CacheLookup, CacheStore, CachedPage},
    domain::{
        decision::CacheDecision,
        render::RenderPriority,
        types::{BotAction, CacheStatus, OutcomeAction},
    },
};

pub use flights::{Flight, FlightAbandoned, FlightFollower, FlightLeader, RenderFlights};
pub use outcome::{EventSink, OutcomeRecord};
pub use upstream::{ProxyError, ProxyRequest, Upstream};

const SOURCE: &str = "application::orchestrator";

pub const HEADER_CACHE: HeaderName = HeaderName::from_static("x-prerender-cache");
pub const HEADER_RULE: HeaderName = HeaderName::from_static("x-prerender-rule");
pub const HEADER_OUTCOME: HeaderName = HeaderName::from_static("x-prerender-outcome");
pub const HEADER_CHALLENGE: HeaderName = HeaderName::from_static("x-prerender-challenge");

const FALLBACK_ATTEMPTS: usize = 2;

const METRIC_SINGLEFLIGHT_JOINS: &str = "prerender_singleflight_joins_total";
const METRIC_SWR_REFRESH: &str = "prerender_swr_refresh_total";

/// Result of one render flight, shared by the leader and all followers.
#[derive(Debug)]
pub enum FlightOutcome {
    Rendered {
        page: CachedPage,
        /// Post-render decision, override marker applied.
        decision: CacheDecision,
        stored: bool,
    },
    /// Another flight stored a fresh page between this request's cache
    /// lookup and taking the lead, so nothing was rendered.
    Cached(CachedPage),
    Failed(RenderError),
}

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Base URL pages are rendered from and passthrough targets. Without it,
    /// pages are rendered at their public URL.
    pub origin: Option<Url>,
    /// Take the client address and scheme from `X-Forwarded-*` headers.
    pub trust_forwarded_for: bool,
    pub max_body_bytes: usize,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            origin: None,
            trust_forwarded_for: false,
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

struct Routed {
    response: Response,
    action: OutcomeAction,
    cache_status: CacheStatus,
    matched_rule: Option<String>,
    is_bot: bool,
}

#[derive(Clone)]
pub struct Orchestrator {
    classifier: Arc<RequestClassifier>,
    policy: Arc<PolicyHandle>,
    cache: Arc<CacheStore>,
    pool: Arc<RenderPool>,
    upstream: Arc<dyn Upstream>,
    flights: RenderFlights<FlightOutcome>,
    events: EventSink,
    options: Arc<OrchestratorOptions>,
}

impl Orchestrator {
    pub fn new(
        classifier: Arc<RequestClassifier>,
        policy: Arc<PolicyHandle>,
        cache: Arc<CacheStore>,
        pool: Arc<RenderPool>,
        upstream: Arc<dyn Upstream>,
        events: EventSink,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            classifier,
            policy,
            cache,
            pool,
            upstream,
            flights: RenderFlights::new(),
            events,
            options: Arc::new(options),
        }
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn pool(&self) -> &Arc<RenderPool> {
        &self.pool
    }

    pub fn policy(&self) -> &Arc<PolicyHandle> {
        &self.policy
    }

    pub fn flights(&self) -> &RenderFlights<FlightOutcome> {
        &self.flights
    }

    pub async fn handle(&self, request: Request, peer: Option<SocketAddr>) -> Response {
        let started = Instant::now();
        let (parts, body) = request.into_parts();
        let client_ip = client_ip(&parts.headers, peer, self.options.trust_forwarded_for);
        let user_agent = parts
            .headers
            .get(header::USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let routed = match to_bytes(body, self.options.max_body_bytes).await {
            Ok(body) => {
                let request = ProxyRequest {
                    method: parts.method.clone(),
                    path_and_query: path_and_query(&parts),
                    headers: parts.headers.clone(),
                    body,
                    client_ip,
                    scheme: self.client_scheme(&parts.headers),
                };
                self.route(&parts, request).await
            }
            Err(err) => Routed {
                response: HttpError::new(
                    SOURCE,
                    StatusCode::PAYLOAD_TOO_LARGE,
                    "Request body too large",
                    err.to_string(),
                )
                .into_response(),
                action: OutcomeAction::Error,
                cache_status: CacheStatus::Bypass,
                matched_rule: None,
                is_bot: false,
            },
        };

        let elapsed = started.elapsed();
        self.events.record(
            OutcomeRecord {
                timestamp: OutcomeRecord::timestamp_now(),
                method: parts.method.to_string(),
                path: parts.uri.path().to_string(),
                ip: client_ip.map(|ip| ip.to_string()),
                user_agent,
                is_bot: routed.is_bot,
                action: routed.action,
                cache_status: routed.cache_status,
                matched_rule: routed.matched_rule,
                status: routed.response.status().as_u16(),
                response_time_ms: elapsed.as_millis() as u64,
            },
            elapsed,
        );
        routed.response
    }

    /// Render `url` as a background warm-up, storing the page when the
    /// post-render decision allows it. Shares a flight already in progress.
    pub async fn warm(&self, url: Url) -> Arc<FlightOutcome> {
        let policy = self.policy.current();
        let key = CacheKey::from_url(&url);
        self.render_once(key, url, RenderPriority::Background, policy)
            .await
    }

    async fn route(&self, parts: &Parts, request: ProxyRequest) -> Routed {
        if parts.method != Method::GET || is_static_asset(parts.uri.path()) {
            return self.passthrough(&request, false, None).await;
        }

        let policy = self.policy.current();
        let classification =
            self.classifier
                .classify(&parts.headers, request.client_ip, &policy.bot_rules);
        let bot_rule = classification.matched_rule().map(str::to_string);

        match classification.action {
            Some(BotAction::Block) => {
                return Routed {
                    response: HttpError::new(
                        SOURCE,
                        StatusCode::FORBIDDEN,
                        "Forbidden",
                        format!(
                            "blocked by bot rule `{}`",
                            bot_rule.as_deref().unwrap_or_default()
                        ),
                    )
                    .into_response(),
                    action: OutcomeAction::Block,
                    cache_status: CacheStatus::Bypass,
                    matched_rule: bot_rule,
                    is_bot: true,
                };
            }
            Some(BotAction::Challenge) => {
                let mut challenged = request;
                challenged
                    .headers
                    .insert(HEADER_CHALLENGE, HeaderValue::from_static("1"));
                return self.passthrough(&challenged, true, bot_rule).await;
            }
            Some(BotAction::Allow | BotAction::Render) | None => {}
        }

        if !classification.is_bot {
            return self.passthrough(&request, false, bot_rule).await;
        }

        let Some(public_url) = self.public_url(parts, &request) else {
            return self.passthrough(&request, true, bot_rule).await;
        };

        let decision = decide(&public_url, &policy.rules, None);
        if decision.is_bypass() {
            debug!(
                target = "rendergate::orchestrator",
                url = %public_url,
                rule = decision.rule_label(),
                reason = %decision.reason,
                "Bypassing render"
            );
            let rule = Some(decision.rule_label().to_string());
            return self.passthrough(&request, true, rule).await;
        }

        let key = CacheKey::from_url(&public_url);
        match self.cache.get(&key).await {
            CacheLookup::Fresh(entry) => {
                let page = CachedPage {
                    html: entry.html,
                    status_code: entry.status_code,
                    headers: entry.headers,
                };
                self.serve(&page, CacheStatus::Fresh, decision.rule_label())
            }
            CacheLookup::Stale(entry) => {
                self.refresh_in_background(key, public_url, policy);
                let page = CachedPage {
                    html: entry.html,
                    status_code: entry.status_code,
                    headers: entry.headers,
                };
                self.serve(&page, CacheStatus::Stale, decision.rule_label())
            }
            CacheLookup::Miss => {
                let outcome = self
                    .render_once(key, public_url, RenderPriority::Foreground, policy)
                    .await;
                match &*outcome {
                    FlightOutcome::Rendered { page, decision, .. } => {
                        self.serve(page, CacheStatus::Miss, decision.rule_label())
                    }
                    FlightOutcome::Cached(page) => {
                        self.serve(page, CacheStatus::Fresh, decision.rule_label())
                    }
                    FlightOutcome::Failed(err) => {
                        self.fallback(&request, err, Some(decision.rule_label().to_string()))
                            .await
                    }
                }
            }
        }
    }

    /// Join or lead the flight for `key` and wait for its outcome. A
    /// foreground leader re-reads the cache first: the previous flight for
    /// the key may have stored its page after this request missed.
    async fn render_once(
        &self,
        key: CacheKey,
        public_url: Url,
        priority: RenderPriority,
        policy: Arc<PolicySnapshot>,
    ) -> Arc<FlightOutcome> {
        match self.flights.join(&key) {
            Flight::Leader(leader) => {
                if priority == RenderPriority::Foreground {
                    if let CacheLookup::Fresh(entry) = self.cache.peek(&key).await {
                        debug!(
                            target = "rendergate::orchestrator",
                            key = %key,
                            "Page stored by an earlier flight; render skipped"
                        );
                        let outcome = Arc::new(FlightOutcome::Cached(CachedPage {
                            html: entry.html,
                            status_code: entry.status_code,
                            headers: entry.headers,
                        }));
                        leader.complete(Arc::clone(&outcome));
                        return outcome;
                    }
                }

                let this = self.clone();
                // Spawned so a disconnecting client cannot cancel a render
                // other requests are waiting on.
                let flight = tokio::spawn(async move {
                    let outcome = Arc::new(
                        this.render_and_store(&key, &public_url, priority, &policy)
                            .await,
                    );
                    leader.complete(Arc::clone(&outcome));
                    outcome
                });
                flight.await.unwrap_or_else(|err| {
                    Arc::new(FlightOutcome::Failed(RenderError::unknown(format!(
                        "render task aborted: {err}"
                    ))))
                })
            }
            Flight::Follower(follower) => {
                counter!(METRIC_SINGLEFLIGHT_JOINS).increment(1);
                debug!(
                    target = "rendergate::orchestrator",
                    key = %key,
                    "Joined in-flight render"
                );
                follower.outcome().await.unwrap_or_else(|err| {
                    Arc::new(FlightOutcome::Failed(RenderError::unknown(err.to_string())))
                })
            }
        }
    }

    fn refresh_in_background(&self, key: CacheKey, public_url: Url, policy: Arc<PolicySnapshot>) {
        let Flight::Leader(leader) = self.flights.join(&key) else {
            debug!(
                target = "rendergate::orchestrator",
                key = %key,
                "Refresh already in flight"
            );
            return;
        };

        let this = self.clone();
        tokio::spawn(async move {
            let outcome = this
                .render_and_store(&key, &public_url, RenderPriority::Background, &policy)
                .await;
            match &outcome {
                FlightOutcome::Rendered { .. } | FlightOutcome::Cached(_) => {
                    counter!(METRIC_SWR_REFRESH, "result" => "success").increment(1);
                    debug!(
                        target = "rendergate::orchestrator",
                        op = "refresh",
                        key = %key,
                        stored = matches!(outcome, FlightOutcome::Rendered { stored: true, .. }),
                        "Stale entry refreshed"
                    );
                }
                FlightOutcome::Failed(err) => {
                    counter!(METRIC_SWR_REFRESH, "result" => "failure").increment(1);
                    warn!(
                        target = "rendergate::orchestrator",
                        op = "refresh",
                        key = %key,
                        error_code = err.kind(),
                        error = %err,
                        "Background refresh failed; stale entry kept"
                    );
                }
            }
            leader.complete(Arc::new(outcome));
        });
    }

    async fn render_and_store(
        &self,
        key: &CacheKey,
        public_url: &Url,
        priority: RenderPriority,
        policy: &PolicySnapshot,
    ) -> FlightOutcome {
        render_page(
            &self.pool,
            Some(&self.cache),
            policy,
            key,
            public_url,
            self.render_url(public_url),
            priority,
        )
        .await
    }

    async fn passthrough(
        &self,
        request: &ProxyRequest,
        is_bot: bool,
        matched_rule: Option<String>,
    ) -> Routed {
        match self.upstream.forward(request).await {
            Ok(mut response) => {
                tag(&mut response, None, matched_rule.as_deref(), OutcomeAction::Proxy);
                Routed {
                    response,
                    action: OutcomeAction::Proxy,
                    cache_status: CacheStatus::Bypass,
                    matched_rule,
                    is_bot,
                }
            }
            Err(err) => Routed {
                response: HttpError::from_error(
                    SOURCE,
                    StatusCode::BAD_GATEWAY,
                    "Bad gateway",
                    &err,
                )
                .into_response(),
                action: OutcomeAction::Error,
                cache_status: CacheStatus::Bypass,
                matched_rule,
                is_bot,
            },
        }
    }

    /// Passthrough after a failed render. The origin gets a second chance
    /// before the caller sees a generic internal error.
    async fn fallback(
        &self,
        request: &ProxyRequest,
        error: &RenderError,
        matched_rule: Option<String>,
    ) -> Routed {
        warn!(
            target = "rendergate::orchestrator",
            path = %request.path_and_query,
            error_code = error.kind(),
            error = %error,
            "Render failed; falling back to origin"
        );

        let mut last_error = None;
        for attempt in 1..=FALLBACK_ATTEMPTS {
            match self.upstream.forward(request).await {
                Ok(mut response) => {
                    tag(
                        &mut response,
                        Some(CacheStatus::Miss),
                        matched_rule.as_deref(),
                        OutcomeAction::Proxy,
                    );
                    return Routed {
                        response,
                        action: OutcomeAction::Fallback,
                        cache_status: CacheStatus::Miss,
                        matched_rule,
                        is_bot: true,
                    };
                }
                Err(err) => {
                    warn!(
                        target = "rendergate::orchestrator",
                        op = "fallback",
                        attempt,
                        error = %err,
                        "Origin fallback failed"
                    );
                    last_error = Some(err);
                }
            }
        }

        let detail = last_error.map_or_else(|| error.to_string(), |err| {
            format!("render failed ({error}); origin fallback failed ({err})")
        });
        Routed {
            response: HttpError::new(
                SOURCE,
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error",
                detail,
            )
            .into_response(),
            action: OutcomeAction::Error,
            cache_status: CacheStatus::Miss,
            matched_rule,
            is_bot: true,
        }
    }

    fn serve(&self, page: &CachedPage, cache_status: CacheStatus, rule: &str) -> Routed {
        let mut response = Response::new(Body::from(page.html.clone()));
        *response.status_mut() = StatusCode::from_u16(page.status_code).unwrap_or(StatusCode::OK);
        for (name, value) in &page.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::from_str(value),
            ) {
                response.headers_mut().insert(name, value);
            }
        }
        tag(&mut response, Some(cache_status), Some(rule), OutcomeAction::Render);

        Routed {
            response,
            action: OutcomeAction::Render,
            cache_status,
            matched_rule: Some(rule.to_string()),
            is_bot: true,
        }
    }

    fn client_scheme(&self, headers: &HeaderMap) -> &'static str {
        let forwarded_https = self.options.trust_forwarded_for
            && headers
                .get("x-forwarded-proto")
                .and_then(|value| value.to_str().ok())
                .is_some_and(|proto| proto.trim().eq_ignore_ascii_case("https"));
        if forwarded_https { "https" } else { "http" }
    }

    /// URL the client asked for, as used for rule matching and cache keys.
    fn public_url(&self, parts: &Parts, request: &ProxyRequest) -> Option<Url> {
        let forwarded_host = self
            .options
            .trust_forwarded_for
            .then(|| parts.headers.get("x-forwarded-host"))
            .flatten();
        let host = forwarded_host
            .or_else(|| parts.headers.get(header::HOST))
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .or_else(|| parts.uri.authority().map(|authority| authority.to_string()))
            .or_else(|| {
                let origin = self.options.origin.as_ref()?;
                let host = origin.host_str()?;
                Some(match origin.port() {
                    Some(port) => format!("{host}:{port}"),
                    None => host.to_string(),
                })
            })?;
        Url::parse(&format!(
            "{}://{}{}",
            request.scheme, host, request.path_and_query
        ))
        .ok()
    }

    fn render_url(&self, public_url: &Url) -> Url {
        let Some(origin) = &self.options.origin else {
            return public_url.clone();
        };
        let mut url = origin.clone();
        url.set_path(public_url.path());
        url.set_query(public_url.query());
        url
    }
}

/// Render `render_url` and, when `cache` is given, store the page under
/// `key` if the post-render decision allows it. Rules and the override marker
/// are evaluated against `public_url`.
pub async fn render_page(
    pool: &RenderPool,
    cache: Option<&CacheStore>,
    policy: &PolicySnapshot,
    key: &CacheKey,
    public_url: &Url,
    render_url: Url,
    priority: RenderPriority,
) -> FlightOutcome {
    let task = pool.task(render_url, priority);
    let result = match pool
        .submit_with(task, Arc::clone(&policy.interceptor))
        .await
    {
        Ok(result) => result,
        Err(err) => return FlightOutcome::Failed(err),
    };

    let decision = decide(public_url, &policy.rules, Some(&result.html));
    let page = CachedPage {
        html: result.html,
        status_code: result.status_code,
        headers: vec![(
            header::CONTENT_TYPE.as_str().to_string(),
            "text/html; charset=utf-8".to_string(),
        )],
    };

    let cacheable = decision.should_cache && (200..300).contains(&page.status_code);
    let stored = match cache {
        Some(cache) if cacheable => {
            cache
                .set(key, page.clone(), Duration::from_secs(decision.ttl_seconds))
                .await;
            true
        }
        _ => {
            debug!(
                target = "rendergate::orchestrator",
                key = %key,
                status = page.status_code,
                reason = %decision.reason,
                "Rendered page not cached"
            );
            false
        }
    };

    FlightOutcome::Rendered {
        page,
        decision,
        stored,
    }
}

fn tag(
    response: &mut Response,
    cache_status: Option<CacheStatus>,
    rule: Option<&str>,
    outcome: OutcomeAction,
) {
    let headers = response.headers_mut();
    if let Some(status) = cache_status {
        headers.insert(HEADER_CACHE, HeaderValue::from_static(status.as_str()));
    }
    if let Some(rule) = rule.and_then(|rule| HeaderValue::from_str(rule).ok()) {
        headers.insert(HEADER_RULE, rule);
    }
    headers.insert(HEADER_OUTCOME, HeaderValue::from_static(outcome.as_str()));
}

fn path_and_query(parts: &Parts) -> String {
    parts
        .uri
        .path_and_query()
        .map_or_else(|| "/".to_string(), |value| value.as_str().to_string())
}

/// Client address: the first `X-Forwarded-For` entry when trusted, otherwise
/// the socket peer.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>, trust_forwarded: bool) -> Option<IpAddr> {
    let forwarded = trust_forwarded
        .then(|| headers.get("x-forwarded-for"))
        .flatten()
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|first| first.trim().parse::<IpAddr>().ok());
    forwarded.or_else(|| peer.map(|addr| addr.ip()))
}

/// Paths whose extension maps to a non-HTML media type never render.
pub fn is_static_asset(path: &str) -> bool {
    let Some(file_name) = path.rsplit('/').next() else {
        return false;
    };
    if !file_name.contains('.') {
        return false;
    }
    mime_guess::from_path(file_name)
        .first()
        .is_some_and(|mime| mime.essence_str() != "text/html")
}
