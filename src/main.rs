use std::{net::SocketAddr, process, sync::Arc, time::Duration};

use futures::{StreamExt, stream};
use rendergate::{
    application::{
        classifier::{IpRanges, RequestClassifier},
        error::AppError,
        orchestrator::{
            EventSink, FlightOutcome, Orchestrator, OrchestratorOptions, Upstream, render_page,
        },
        policy::{PolicyBaseline, PolicyDocument, PolicyHandle, PolicySnapshot},
        render::{PoolConfig, RenderPool},
    },
    cache::{CacheConfig, CacheKey, CacheStore},
    config,
    domain::render::RenderPriority,
    infra::{
        browser::RemoteBrowserEngine,
        error::InfraError,
        events::EventForwarder,
        http::{self, HttpState},
        ip_feeds::HttpIpRangeSource,
        proxy::OriginProxy,
        telemetry,
    },
};
use tokio::{sync::oneshot, task::JoinHandle, time::timeout};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;
use url::Url;

const EVENT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Render(args) => run_render(settings, args).await,
        config::Command::Invalidate(args) => run_invalidate(settings, args).await,
        config::Command::CheckPolicy(args) => run_check_policy(settings, args).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let origin = settings
        .require_origin()
        .map_err(|err| AppError::validation(err.to_string()))?
        .clone();

    let policy = load_policy(&settings).await?;
    let pool = build_pool(&settings, policy.pool_concurrency())?;
    let cache = Arc::new(CacheStore::connect(CacheConfig::from(&settings.cache)).await);

    let ip_ranges = settings
        .classifier
        .ip_ranges_enabled
        .then(|| Arc::new(IpRanges::with_static_fallback()));
    let classifier = Arc::new(RequestClassifier::new(ip_ranges.clone()));

    let upstream: Arc<dyn Upstream> =
        Arc::new(OriginProxy::new(origin.clone(), settings.origin.timeout).map_err(AppError::from)?);

    let (events, receiver) = EventSink::channel(settings.events.capacity.get());
    let forwarder = EventForwarder::new(&settings.events).map_err(AppError::from)?;

    let orchestrator = Orchestrator::new(
        classifier,
        Arc::clone(&policy),
        Arc::clone(&cache),
        Arc::clone(&pool),
        upstream,
        events,
        OrchestratorOptions {
            origin: Some(origin.clone()),
            trust_forwarded_for: settings.server.trust_forwarded_for,
            max_body_bytes: settings.origin.max_body_bytes.get(),
        },
    );

    let mut background = vec![spawn_sweeper(Arc::clone(&cache), settings.cache.sweep_interval)];
    if policy.path().is_some() {
        background.push(tokio::spawn(
            Arc::clone(&policy).watch(settings.policy.reload),
        ));
    }
    if let Some(ranges) = ip_ranges {
        let source = HttpIpRangeSource::new(settings.classifier.feeds.clone())
            .map_err(AppError::from)?;
        background.push(spawn_ip_refresh(
            ranges,
            source,
            settings.classifier.ip_refresh,
        ));
    }
    let forwarder_handle = tokio::spawn(forwarder.run(receiver));

    info!(
        target = "rendergate::serve",
        addr = %settings.server.addr,
        origin = %origin,
        cache_backend = cache.backend_name(),
        max_concurrency = pool.config().max_concurrency,
        "Starting prerender proxy"
    );

    let result = serve_http(&settings, HttpState { orchestrator }).await;

    for handle in background {
        handle.abort();
        let _ = handle.await;
    }
    pool.shutdown().await;

    if timeout(EVENT_DRAIN_TIMEOUT, forwarder_handle).await.is_err() {
        warn!(
            target = "rendergate::serve",
            "Traffic event queue not drained before shutdown"
        );
    }

    result
}

async fn run_render(settings: config::Settings, args: config::RenderArgs) -> Result<(), AppError> {
    let policy = load_policy(&settings).await?;
    let pool = build_pool(&settings, policy.pool_concurrency())?;
    let cache = if args.store {
        Some(CacheStore::connect(CacheConfig::from(&settings.cache)).await)
    } else {
        None
    };
    let snapshot = policy.current();
    let concurrency = args.concurrency.clamp(1, 64);

    info!(
        target = "rendergate::render",
        urls = args.urls.len(),
        concurrency,
        store = args.store,
        "Starting batch render"
    );

    let total = args.urls.len();
    let failures = stream::iter(args.urls)
        .map(|raw| {
            let pool = &pool;
            let cache = cache.as_ref();
            let snapshot = &snapshot;
            async move {
                let url = match Url::parse(&raw) {
                    Ok(url) => url,
                    Err(err) => {
                        println!("{raw}\tinvalid\t{err}");
                        return false;
                    }
                };
                let key = CacheKey::from_url(&url);
                let outcome = render_page(
                    pool,
                    cache,
                    snapshot,
                    &key,
                    &url,
                    url.clone(),
                    RenderPriority::Foreground,
                )
                .await;
                match outcome {
                    FlightOutcome::Rendered {
                        page,
                        decision,
                        stored,
                    } => {
                        println!(
                            "{url}\t{}\t{} bytes\trule={}\tstored={stored}",
                            page.status_code,
                            page.html.len(),
                            decision.rule_label()
                        );
                        true
                    }
                    FlightOutcome::Cached(page) => {
                        println!("{url}\t{}\t{} bytes\tcached", page.status_code, page.html.len());
                        true
                    }
                    FlightOutcome::Failed(err) => {
                        println!("{url}\tfailed\t{}\t{err}", err.kind());
                        false
                    }
                }
            }
        })
        .buffer_unordered(concurrency)
        .filter(|ok| std::future::ready(!ok))
        .count()
        .await;

    pool.shutdown().await;

    if failures > 0 {
        return Err(AppError::validation(format!(
            "{failures} of {total} renders failed"
        )));
    }
    Ok(())
}

async fn run_invalidate(
    settings: config::Settings,
    args: config::InvalidateArgs,
) -> Result<(), AppError> {
    let cache = CacheStore::connect(CacheConfig::from(&settings.cache)).await;
    let removed = cache.delete_by_pattern(&args.pattern).await;
    info!(
        target = "rendergate::invalidate",
        pattern = %args.pattern,
        removed,
        backend = cache.backend_name(),
        "Cache entries invalidated"
    );
    println!("{removed}");
    Ok(())
}

async fn run_check_policy(
    settings: config::Settings,
    args: config::CheckPolicyArgs,
) -> Result<(), AppError> {
    let (document, _) = PolicyDocument::read(&args.file)
        .await
        .map_err(AppError::from)?;
    let snapshot = PolicySnapshot::compile(&document, &policy_baseline(&settings));
    let (cache_rules, bot_rules, block_rules) = snapshot.rule_counts();

    println!("cache rules: {cache_rules}");
    println!("bot rules:   {bot_rules}");
    println!("block rules: {block_rules}");
    if let Some(pool) = &document.pool {
        println!("pool:        max_concurrency = {}", pool.max_concurrency);
    }
    for skipped in &snapshot.skipped {
        println!("skipped `{}`: {}", skipped.id, skipped.reason);
    }
    Ok(())
}

fn policy_baseline(settings: &config::Settings) -> PolicyBaseline {
    PolicyBaseline {
        allow_types: settings.render.allow_resource_types.clone(),
        default_ttl_seconds: settings.cache.ttl.as_secs(),
    }
}

async fn load_policy(settings: &config::Settings) -> Result<Arc<PolicyHandle>, AppError> {
    let baseline = policy_baseline(settings);
    let handle = match settings.policy.file.as_ref() {
        Some(path) => PolicyHandle::load(
            path.clone(),
            baseline,
            settings.render.max_concurrency.get(),
        )
        .await
        .map_err(AppError::from)?,
        None => PolicyHandle::fixed(PolicySnapshot::compile(
            &PolicyDocument::default(),
            &baseline,
        )),
    };
    Ok(Arc::new(handle))
}

fn build_pool(
    settings: &config::Settings,
    pool_concurrency: Option<usize>,
) -> Result<Arc<RenderPool>, AppError> {
    let engine = RemoteBrowserEngine::new(
        &settings.render.engine_url,
        settings.render.engine_token.as_deref(),
    )
    .map_err(AppError::from)?;

    let mut config = PoolConfig::from(&settings.render);
    if let Some(concurrency) = pool_concurrency {
        config.max_concurrency = concurrency;
    }
    Ok(Arc::new(RenderPool::new(Arc::new(engine), config)))
}

fn spawn_sweeper(cache: Arc<CacheStore>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await; // Skip the first immediate tick
        loop {
            interval.tick().await;
            cache.sweep();
        }
    })
}

fn spawn_ip_refresh(
    ranges: Arc<IpRanges>,
    source: HttpIpRangeSource,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            ranges.refresh(&source).await;
        }
    })
}

async fn serve_http(settings: &config::Settings, state: HttpState) -> Result<(), AppError> {
    let router = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = stop_rx.await;
    });
    let mut server = tokio::spawn(server.into_future());

    tokio::select! {
        joined = &mut server => {
            return joined
                .map_err(|err| AppError::unexpected(format!("server task failed: {err}")))?
                .map_err(|err| AppError::unexpected(format!("server error: {err}")));
        }
        () = shutdown_signal() => {}
    }

    info!(
        target = "rendergate::serve",
        grace_seconds = settings.server.graceful_shutdown.as_secs(),
        "Shutdown requested; draining connections"
    );
    let _ = stop_tx.send(());

    match timeout(settings.server.graceful_shutdown, &mut server).await {
        Ok(joined) => joined
            .map_err(|err| AppError::unexpected(format!("server task failed: {err}")))?
            .map_err(|err| AppError::unexpected(format!("server error: {err}"))),
        Err(_) => {
            warn!(
                target = "rendergate::serve",
                "Graceful shutdown timed out; closing remaining connections"
            );
            server.abort();
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(
            target = "rendergate::serve",
            error = %err,
            "Failed to listen for shutdown signal"
        );
        std::future::pending::<()>().await;
    }
}
