#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    response::Response,
};
use http_body_util::BodyExt;
use rendergate::{
    application::{
        classifier::RequestClassifier,
        interceptor::ResourceInterceptor,
        orchestrator::{
            EventSink, Orchestrator, OrchestratorOptions, ProxyError, ProxyRequest, Upstream,
        },
        policy::{PolicyBaseline, PolicyDocument, PolicyHandle, PolicySnapshot},
        render::{
            BrowserEngine, BrowserSession, NetworkEvent, PageContent, PoolConfig, RenderError,
            RenderPool, WaitCondition,
        },
    },
    cache::{CacheConfig, CacheStore},
};
use url::Url;

pub const GOOGLEBOT: &str = "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)";
pub const BROWSER: &str =
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_5) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.5 Safari/605.1.15";

/// What the fake engine produces for a path.
#[derive(Debug, Clone)]
pub enum PageScript {
    Html { html: String, status: u16 },
    Fail(RenderError),
}

impl PageScript {
    pub fn html(html: &str) -> Self {
        Self::Html {
            html: html.to_string(),
            status: 200,
        }
    }
}

#[derive(Default)]
struct EngineState {
    pages: Mutex<HashMap<String, PageScript>>,
    fallback: Mutex<Option<PageScript>>,
    delay: Mutex<Duration>,
    renders: AtomicUsize,
    rendered_urls: Mutex<Vec<String>>,
}

impl EngineState {
    fn lookup(&self, url: &Url) -> PageScript {
        if let Some(script) = self.pages.lock().expect("pages lock").get(url.path()) {
            return script.clone();
        }
        self.fallback
            .lock()
            .expect("fallback lock")
            .clone()
            .unwrap_or_else(|| PageScript::html("<html><body>rendered</body></html>"))
    }
}

/// Browser engine that answers from a per-path script.
pub struct FakeEngine {
    state: Arc<EngineState>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(EngineState::default()),
        })
    }

    pub fn script(&self, path: &str, script: PageScript) {
        self.state
            .pages
            .lock()
            .expect("pages lock")
            .insert(path.to_string(), script);
    }

    pub fn fail_everything(&self, error: RenderError) {
        *self.state.fallback.lock().expect("fallback lock") = Some(PageScript::Fail(error));
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.state.delay.lock().expect("delay lock") = delay;
    }

    /// Navigations attempted, successful or not.
    pub fn renders(&self) -> usize {
        self.state.renders.load(Ordering::SeqCst)
    }

    pub fn rendered_urls(&self) -> Vec<String> {
        self.state.rendered_urls.lock().expect("urls lock").clone()
    }
}

#[async_trait]
impl BrowserEngine for FakeEngine {
    async fn open_session(&self) -> Result<Box<dyn BrowserSession>, RenderError> {
        Ok(Box::new(FakeSession {
            state: Arc::clone(&self.state),
            loaded: None,
        }))
    }
}

struct FakeSession {
    state: Arc<EngineState>,
    loaded: Option<(PageScript, Duration)>,
}

#[async_trait]
impl BrowserSession for FakeSession {
    async fn navigate(
        &mut self,
        url: &Url,
        _interceptor: Arc<ResourceInterceptor>,
    ) -> Result<(), RenderError> {
        self.state.renders.fetch_add(1, Ordering::SeqCst);
        self.state
            .rendered_urls
            .lock()
            .expect("urls lock")
            .push(url.to_string());
        let script = self.state.lookup(url);
        let delay = *self.state.delay.lock().expect("delay lock");
        if let PageScript::Fail(err) = &script {
            return Err(err.clone());
        }
        self.loaded = Some((script, delay));
        Ok(())
    }

    async fn wait_for(
        &mut self,
        _condition: WaitCondition,
        _timeout: Duration,
    ) -> Result<(), RenderError> {
        let delay = self.loaded.as_ref().map_or(Duration::ZERO, |(_, delay)| *delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn content(&mut self) -> Result<PageContent, RenderError> {
        match self.loaded.take() {
            Some((PageScript::Html { html, status }, _)) => Ok(PageContent { html, status }),
            Some((PageScript::Fail(err), _)) => Err(err),
            None => Err(RenderError::unknown("nothing loaded")),
        }
    }

    fn network_events(&self) -> Vec<NetworkEvent> {
        Vec::new()
    }

    async fn close(self: Box<Self>) {}
}

/// Origin double that records every forwarded request.
pub struct FakeOrigin {
    requests: Mutex<Vec<ProxyRequest>>,
    failing: AtomicUsize,
}

impl FakeOrigin {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            failing: AtomicUsize::new(0),
        })
    }

    /// Fail the next `count` forwards.
    pub fn fail_next(&self, count: usize) {
        self.failing.store(count, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<ProxyRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn hits(&self) -> usize {
        self.requests.lock().expect("requests lock").len()
    }
}

#[async_trait]
impl Upstream for FakeOrigin {
    async fn forward(&self, request: &ProxyRequest) -> Result<Response, ProxyError> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        let failing = self.failing.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing.store(failing - 1, Ordering::SeqCst);
            return Err(ProxyError::Connect {
                message: "connection refused".to_string(),
            });
        }
        let mut response = Response::new(Body::from(format!("origin:{}", request.path_and_query)));
        *response.status_mut() = StatusCode::OK;
        response
            .headers_mut()
            .insert("x-origin", "1".parse().expect("header value"));
        Ok(response)
    }
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub engine: Arc<FakeEngine>,
    pub origin: Arc<FakeOrigin>,
    pub cache: Arc<CacheStore>,
    pub pool: Arc<RenderPool>,
    pub policy: Arc<PolicyHandle>,
}

pub fn pool_config() -> PoolConfig {
    let mut config = PoolConfig {
        max_concurrency: 2,
        max_retries: 1,
        task_deadline: Duration::from_secs(10),
        wait_timeout: Duration::from_secs(2),
        queue_timeout: Duration::from_secs(5),
        ..PoolConfig::default()
    };
    config.breaker.error_threshold = 2;
    config.backoff = rendergate::application::render::Backoff::new(
        rendergate::application::render::BackoffKind::Linear,
        Duration::from_millis(5),
        Duration::from_millis(10),
    );
    config
}

pub fn policy(source: &str) -> PolicySnapshot {
    let document = PolicyDocument::parse(source).expect("policy parses");
    PolicySnapshot::compile(&document, &PolicyBaseline::default())
}

pub fn harness(policy_source: &str) -> Harness {
    harness_with(policy_source, CacheConfig::default())
}

pub fn harness_with(policy_source: &str, cache_config: CacheConfig) -> Harness {
    let engine = FakeEngine::new();
    let origin = FakeOrigin::new();
    let cache = Arc::new(CacheStore::in_memory(cache_config));
    let pool = Arc::new(RenderPool::new(engine.clone(), pool_config()));
    let policy = Arc::new(PolicyHandle::fixed(policy(policy_source)));
    let (events, _receiver) = EventSink::channel(64);

    let orchestrator = Orchestrator::new(
        Arc::new(RequestClassifier::user_agent_only()),
        Arc::clone(&policy),
        Arc::clone(&cache),
        Arc::clone(&pool),
        origin.clone(),
        events,
        OrchestratorOptions {
            origin: Some(Url::parse("http://origin.internal:8080").expect("origin url")),
            trust_forwarded_for: false,
            max_body_bytes: 1024 * 1024,
        },
    );

    Harness {
        orchestrator,
        engine,
        origin,
        cache,
        pool,
        policy,
    }
}

pub fn get(path: &str, user_agent: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(path)
        .header("host", "www.example.com")
        .header("user-agent", user_agent)
        .body(Body::empty())
        .expect("request")
}

pub async fn body_text(response: Response) -> String {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    String::from_utf8(bytes.to_vec()).expect("utf-8 body")
}

pub fn header<'a>(response: &'a Response, name: &str) -> Option<&'a str> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
}
