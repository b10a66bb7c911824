//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{
    net::SocketAddr,
    num::{NonZeroU32, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

pub use cli::{
    CacheOverride, CheckPolicyArgs, CliArgs, Command, EngineOverrides, InvalidateArgs,
    RenderArgs, ServeArgs, ServeOverrides,
};

use crate::{application::render::BackoffKind, cache::MAX_TTL_SECONDS, domain::types::ResourceType};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "rendergate";
const ENV_PREFIX: &str = "RENDERGATE";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_ORIGIN_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_BODY_BYTES: u64 = 10 * 1024 * 1024;
const DEFAULT_ENGINE_URL: &str = "http://127.0.0.1:9222";
const DEFAULT_MAX_CONCURRENCY: u64 = 4;
const DEFAULT_BACKGROUND_CONCURRENCY: u64 = 1;
const DEFAULT_MAX_RETRIES: u32 = 2;
const DEFAULT_BACKOFF_BASE_MS: u64 = 250;
const DEFAULT_BACKOFF_MAX_MS: u64 = 4_000;
const DEFAULT_TASK_DEADLINE_SECS: u64 = 45;
const DEFAULT_WAIT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_IDLE_QUIET_MS: u64 = 500;
const DEFAULT_DOM_GRACE_MS: u64 = 1_000;
const DEFAULT_QUEUE_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_BREAKER_ERROR_THRESHOLD: u64 = 5;
const DEFAULT_BREAKER_MONITORING_SECS: u64 = 60;
const DEFAULT_BREAKER_RESET_SECS: u64 = 30;
const DEFAULT_BREAKER_HALF_OPEN_CALLS: u64 = 1;
const DEFAULT_CACHE_MAX_ENTRIES: u64 = 1_000;
const DEFAULT_CACHE_TTL_SECS: u64 = 86_400;
const DEFAULT_CACHE_STALE_SECS: u64 = 3_600;
const DEFAULT_CACHE_SWEEP_SECS: u64 = 60;
const DEFAULT_REDIS_KEY_PREFIX: &str = "prerender:";
const DEFAULT_REDIS_RETRY_SECS: u64 = 30;
const DEFAULT_REDIS_CONNECT_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_IP_REFRESH_SECS: u64 = 86_400;
const DEFAULT_AWS_FEED: &str = "https://ip-ranges.amazonaws.com/ip-ranges.json";
const DEFAULT_GCP_FEED: &str = "https://www.gstatic.com/ipranges/cloud.json";
const DEFAULT_CLOUDFLARE_FEED: &str = "https://www.cloudflare.com/ips-v4";
const DEFAULT_DIGITALOCEAN_FEED: &str = "https://www.digitalocean.com/geo/google.csv";
const DEFAULT_POLICY_RELOAD_SECS: u64 = 30;
const DEFAULT_EVENTS_CAPACITY: u64 = 1_024;
const DEFAULT_EVENTS_BATCH_SIZE: u64 = 100;
const DEFAULT_EVENTS_FLUSH_MS: u64 = 2_000;

#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub origin: OriginSettings,
    pub render: RenderSettings,
    pub cache: CacheSettings,
    pub classifier: ClassifierSettings,
    pub policy: PolicySettings,
    pub events: EventsSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
    pub trust_forwarded_for: bool,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct OriginSettings {
    /// Required by `serve`; other commands run without an origin.
    pub url: Option<Url>,
    pub timeout: Duration,
    pub max_body_bytes: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub engine_url: Url,
    pub engine_token: Option<String>,
    pub max_concurrency: NonZeroUsize,
    pub background_concurrency: NonZeroUsize,
    pub max_retries: u32,
    pub backoff: BackoffKind,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub task_deadline: Duration,
    pub wait_timeout: Duration,
    pub idle_quiet: Duration,
    pub dom_grace: Duration,
    pub queue_timeout: Duration,
    pub allow_resource_types: Vec<ResourceType>,
    pub breaker: BreakerSettings,
}

#[derive(Debug, Clone)]
pub struct BreakerSettings {
    pub error_threshold: NonZeroU32,
    pub monitoring_period: Duration,
    pub reset_timeout: Duration,
    pub half_open_max_calls: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub max_entries: NonZeroUsize,
    pub ttl: Duration,
    pub stale_window: Duration,
    pub sweep_interval: Duration,
    pub redis_url: Option<String>,
    pub redis_key_prefix: String,
    pub redis_retry: Duration,
    pub redis_connect_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ClassifierSettings {
    pub ip_ranges_enabled: bool,
    pub ip_refresh: Duration,
    pub feeds: FeedSettings,
}

/// Published range feeds; `None` keeps the provider on its static table.
#[derive(Debug, Clone)]
pub struct FeedSettings {
    pub aws: Option<Url>,
    pub gcp: Option<Url>,
    pub cloudflare: Option<Url>,
    pub digitalocean: Option<Url>,
}

#[derive(Debug, Clone)]
pub struct PolicySettings {
    pub file: Option<PathBuf>,
    pub reload: Duration,
}

#[derive(Debug, Clone)]
pub struct EventsSettings {
    pub capacity: NonZeroUsize,
    pub endpoint: Option<Url>,
    pub batch_size: NonZeroUsize,
    pub flush_interval: Duration,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    pub(crate) fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

impl Settings {
    /// Origin URL, which only `serve` requires.
    pub fn require_origin(&self) -> Result<&Url, LoadError> {
        self.origin
            .url
            .as_ref()
            .ok_or_else(|| LoadError::invalid("origin.url", "required to serve traffic"))
    }
}

/// Resolve configuration using the supplied CLI arguments.
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Render(args)) => {
            raw.apply_engine_overrides(&args.engine);
            raw.apply_cache_override(&args.cache);
        }
        Some(Command::Invalidate(args)) => raw.apply_cache_override(&args.cache),
        Some(Command::CheckPolicy(_)) => {}
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    origin: RawOriginSettings,
    render: RawRenderSettings,
    breaker: RawBreakerSettings,
    cache: RawCacheSettings,
    classifier: RawClassifierSettings,
    policy: RawPolicySettings,
    events: RawEventsSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(trust) = overrides.trust_forwarded_for {
            self.server.trust_forwarded_for = Some(trust);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.origin_url.as_ref() {
            self.origin.url = Some(url.clone());
        }
        if let Some(path) = overrides.policy_file.as_ref() {
            self.policy.file = Some(path.clone());
        }
        self.apply_engine_overrides(&overrides.engine);
        self.apply_cache_override(&overrides.cache);
    }

    fn apply_engine_overrides(&mut self, overrides: &EngineOverrides) {
        if let Some(url) = overrides.engine_url.as_ref() {
            self.render.engine_url = Some(url.clone());
        }
        if let Some(count) = overrides.max_concurrency {
            self.render.max_concurrency = Some(count);
        }
    }

    fn apply_cache_override(&mut self, overrides: &CacheOverride) {
        if let Some(url) = overrides.redis_url.as_ref() {
            self.cache.redis_url = Some(url.clone());
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
    trust_forwarded_for: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawOriginSettings {
    url: Option<String>,
    timeout_seconds: Option<u64>,
    max_body_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRenderSettings {
    engine_url: Option<String>,
    engine_token: Option<String>,
    max_concurrency: Option<u64>,
    background_concurrency: Option<u64>,
    max_retries: Option<u32>,
    backoff: Option<String>,
    backoff_base_ms: Option<u64>,
    backoff_max_ms: Option<u64>,
    task_deadline_seconds: Option<u64>,
    wait_timeout_ms: Option<u64>,
    idle_quiet_ms: Option<u64>,
    dom_grace_ms: Option<u64>,
    queue_timeout_ms: Option<u64>,
    allow_resource_types: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBreakerSettings {
    error_threshold: Option<u64>,
    monitoring_period_seconds: Option<u64>,
    reset_timeout_seconds: Option<u64>,
    half_open_max_calls: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    max_entries: Option<u64>,
    ttl_seconds: Option<u64>,
    stale_window_seconds: Option<u64>,
    sweep_interval_seconds: Option<u64>,
    redis_url: Option<String>,
    redis_key_prefix: Option<String>,
    redis_retry_seconds: Option<u64>,
    redis_connect_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawClassifierSettings {
    ip_ranges_enabled: Option<bool>,
    ip_refresh_seconds: Option<u64>,
    aws_feed_url: Option<String>,
    gcp_feed_url: Option<String>,
    cloudflare_feed_url: Option<String>,
    digitalocean_feed_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPolicySettings {
    file: Option<PathBuf>,
    reload_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawEventsSettings {
    capacity: Option<u64>,
    endpoint: Option<String>,
    batch_size: Option<u64>,
    flush_interval_ms: Option<u64>,
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            origin,
            render,
            breaker,
            cache,
            classifier,
            policy,
            events,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let origin = build_origin_settings(origin)?;
        let breaker = build_breaker_settings(breaker)?;
        let render = build_render_settings(render, breaker)?;
        let cache = build_cache_settings(cache)?;
        let classifier = build_classifier_settings(classifier)?;
        let policy = build_policy_settings(policy)?;
        let events = build_events_settings(events)?;

        Ok(Self {
            server,
            logging,
            origin,
            render,
            cache,
            classifier,
            policy,
            events,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr =
        parse_socket_addr(&host, port).map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
        trust_forwarded_for: server.trust_forwarded_for.unwrap_or(false),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_origin_settings(origin: RawOriginSettings) -> Result<OriginSettings, LoadError> {
    let url = optional_http_url(origin.url, "origin.url")?;

    let timeout_secs = origin.timeout_seconds.unwrap_or(DEFAULT_ORIGIN_TIMEOUT_SECS);
    let timeout = positive_duration(timeout_secs, "origin.timeout_seconds", Duration::from_secs)?;

    let max_body_bytes = non_zero_usize(
        origin.max_body_bytes.unwrap_or(DEFAULT_MAX_BODY_BYTES),
        "origin.max_body_bytes",
    )?;

    Ok(OriginSettings {
        url,
        timeout,
        max_body_bytes,
    })
}

fn build_render_settings(
    render: RawRenderSettings,
    breaker: BreakerSettings,
) -> Result<RenderSettings, LoadError> {
    let engine_url = optional_http_url(render.engine_url, "render.engine_url")?
        .map(Ok)
        .unwrap_or_else(|| {
            Url::parse(DEFAULT_ENGINE_URL)
                .map_err(|err| LoadError::invalid("render.engine_url", err.to_string()))
        })?;

    let engine_token = render.engine_token.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    let max_concurrency = non_zero_usize(
        render.max_concurrency.unwrap_or(DEFAULT_MAX_CONCURRENCY),
        "render.max_concurrency",
    )?;
    let background_concurrency = non_zero_usize(
        render
            .background_concurrency
            .unwrap_or(DEFAULT_BACKGROUND_CONCURRENCY),
        "render.background_concurrency",
    )?;
    if background_concurrency > max_concurrency {
        return Err(LoadError::invalid(
            "render.background_concurrency",
            "must not exceed render.max_concurrency",
        ));
    }

    let backoff = match render.backoff {
        Some(value) => BackoffKind::from_str(value.trim())
            .map_err(|reason| LoadError::invalid("render.backoff", reason))?,
        None => BackoffKind::Exponential,
    };

    let backoff_base = Duration::from_millis(
        render.backoff_base_ms.unwrap_or(DEFAULT_BACKOFF_BASE_MS),
    );
    let backoff_max = Duration::from_millis(render.backoff_max_ms.unwrap_or(DEFAULT_BACKOFF_MAX_MS));
    if backoff_base > backoff_max {
        return Err(LoadError::invalid(
            "render.backoff_base_ms",
            "must not exceed render.backoff_max_ms",
        ));
    }

    let task_deadline = positive_duration(
        render
            .task_deadline_seconds
            .unwrap_or(DEFAULT_TASK_DEADLINE_SECS),
        "render.task_deadline_seconds",
        Duration::from_secs,
    )?;
    let wait_timeout = positive_duration(
        render.wait_timeout_ms.unwrap_or(DEFAULT_WAIT_TIMEOUT_MS),
        "render.wait_timeout_ms",
        Duration::from_millis,
    )?;
    let queue_timeout = positive_duration(
        render.queue_timeout_ms.unwrap_or(DEFAULT_QUEUE_TIMEOUT_MS),
        "render.queue_timeout_ms",
        Duration::from_millis,
    )?;

    let allow_resource_types = render
        .allow_resource_types
        .unwrap_or_default()
        .iter()
        .map(|value| {
            ResourceType::from_str(value.trim())
                .map_err(|err| LoadError::invalid("render.allow_resource_types", err.to_string()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(RenderSettings {
        engine_url,
        engine_token,
        max_concurrency,
        background_concurrency,
        max_retries: render.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
        backoff,
        backoff_base,
        backoff_max,
        task_deadline,
        wait_timeout,
        idle_quiet: Duration::from_millis(render.idle_quiet_ms.unwrap_or(DEFAULT_IDLE_QUIET_MS)),
        dom_grace: Duration::from_millis(render.dom_grace_ms.unwrap_or(DEFAULT_DOM_GRACE_MS)),
        queue_timeout,
        allow_resource_types,
        breaker,
    })
}

fn build_breaker_settings(breaker: RawBreakerSettings) -> Result<BreakerSettings, LoadError> {
    let error_threshold = non_zero_u32(
        breaker
            .error_threshold
            .unwrap_or(DEFAULT_BREAKER_ERROR_THRESHOLD),
        "breaker.error_threshold",
    )?;
    let monitoring_period = positive_duration(
        breaker
            .monitoring_period_seconds
            .unwrap_or(DEFAULT_BREAKER_MONITORING_SECS),
        "breaker.monitoring_period_seconds",
        Duration::from_secs,
    )?;
    let reset_timeout = positive_duration(
        breaker
            .reset_timeout_seconds
            .unwrap_or(DEFAULT_BREAKER_RESET_SECS),
        "breaker.reset_timeout_seconds",
        Duration::from_secs,
    )?;
    let half_open_max_calls = non_zero_u32(
        breaker
            .half_open_max_calls
            .unwrap_or(DEFAULT_BREAKER_HALF_OPEN_CALLS),
        "breaker.half_open_max_calls",
    )?;

    Ok(BreakerSettings {
        error_threshold,
        monitoring_period,
        reset_timeout,
        half_open_max_calls,
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let max_entries = non_zero_usize(
        cache.max_entries.unwrap_or(DEFAULT_CACHE_MAX_ENTRIES),
        "cache.max_entries",
    )?;
    let ttl = positive_duration(
        at_most(
            cache.ttl_seconds.unwrap_or(DEFAULT_CACHE_TTL_SECS),
            MAX_TTL_SECONDS,
            "cache.ttl_seconds",
        )?,
        "cache.ttl_seconds",
        Duration::from_secs,
    )?;
    let stale_window = Duration::from_secs(at_most(
        cache.stale_window_seconds.unwrap_or(DEFAULT_CACHE_STALE_SECS),
        MAX_TTL_SECONDS,
        "cache.stale_window_seconds",
    )?);
    let redis_retry = Duration::from_secs(at_most(
        cache
            .redis_retry_seconds
            .unwrap_or(DEFAULT_REDIS_RETRY_SECS),
        MAX_TTL_SECONDS,
        "cache.redis_retry_seconds",
    )?);
    let sweep_interval = positive_duration(
        cache
            .sweep_interval_seconds
            .unwrap_or(DEFAULT_CACHE_SWEEP_SECS),
        "cache.sweep_interval_seconds",
        Duration::from_secs,
    )?;

    let redis_url = cache.redis_url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });
    if let Some(url) = redis_url.as_deref() {
        if !url.starts_with("redis://") && !url.starts_with("rediss://") {
            return Err(LoadError::invalid(
                "cache.redis_url",
                "must use the redis:// or rediss:// scheme",
            ));
        }
    }

    let redis_connect_timeout = positive_duration(
        cache
            .redis_connect_timeout_ms
            .unwrap_or(DEFAULT_REDIS_CONNECT_TIMEOUT_MS),
        "cache.redis_connect_timeout_ms",
        Duration::from_millis,
    )?;

    Ok(CacheSettings {
        max_entries,
        ttl,
        stale_window,
        sweep_interval,
        redis_url,
        redis_key_prefix: cache
            .redis_key_prefix
            .unwrap_or_else(|| DEFAULT_REDIS_KEY_PREFIX.to_string()),
        redis_retry,
        redis_connect_timeout,
    })
}

fn build_classifier_settings(
    classifier: RawClassifierSettings,
) -> Result<ClassifierSettings, LoadError> {
    let ip_refresh = positive_duration(
        classifier
            .ip_refresh_seconds
            .unwrap_or(DEFAULT_IP_REFRESH_SECS),
        "classifier.ip_refresh_seconds",
        Duration::from_secs,
    )?;

    let feeds = FeedSettings {
        aws: feed_url(classifier.aws_feed_url, DEFAULT_AWS_FEED, "classifier.aws_feed_url")?,
        gcp: feed_url(classifier.gcp_feed_url, DEFAULT_GCP_FEED, "classifier.gcp_feed_url")?,
        cloudflare: feed_url(
            classifier.cloudflare_feed_url,
            DEFAULT_CLOUDFLARE_FEED,
            "classifier.cloudflare_feed_url",
        )?,
        digitalocean: feed_url(
            classifier.digitalocean_feed_url,
            DEFAULT_DIGITALOCEAN_FEED,
            "classifier.digitalocean_feed_url",
        )?,
    };

    Ok(ClassifierSettings {
        ip_ranges_enabled: classifier.ip_ranges_enabled.unwrap_or(true),
        ip_refresh,
        feeds,
    })
}

fn build_policy_settings(policy: RawPolicySettings) -> Result<PolicySettings, LoadError> {
    let file = policy
        .file
        .filter(|path| !path.as_os_str().is_empty());
    let reload = positive_duration(
        policy.reload_seconds.unwrap_or(DEFAULT_POLICY_RELOAD_SECS),
        "policy.reload_seconds",
        Duration::from_secs,
    )?;

    Ok(PolicySettings { file, reload })
}

fn build_events_settings(events: RawEventsSettings) -> Result<EventsSettings, LoadError> {
    let capacity = non_zero_usize(
        events.capacity.unwrap_or(DEFAULT_EVENTS_CAPACITY),
        "events.capacity",
    )?;
    let endpoint = optional_http_url(events.endpoint, "events.endpoint")?;
    let batch_size = non_zero_usize(
        events.batch_size.unwrap_or(DEFAULT_EVENTS_BATCH_SIZE),
        "events.batch_size",
    )?;
    let flush_interval = positive_duration(
        events.flush_interval_ms.unwrap_or(DEFAULT_EVENTS_FLUSH_MS),
        "events.flush_interval_ms",
        Duration::from_millis,
    )?;

    Ok(EventsSettings {
        capacity,
        endpoint,
        batch_size,
        flush_interval,
    })
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn optional_http_url(value: Option<String>, key: &'static str) -> Result<Option<Url>, LoadError> {
    let Some(value) = value else {
        return Ok(None);
    };
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let url = Url::parse(trimmed).map_err(|err| LoadError::invalid(key, err.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(LoadError::invalid(key, "must use the http or https scheme"));
    }
    Ok(Some(url))
}

/// A missing value selects the default feed; an empty string disables it.
fn feed_url(
    value: Option<String>,
    default: &str,
    key: &'static str,
) -> Result<Option<Url>, LoadError> {
    match value {
        Some(value) => optional_http_url(Some(value), key),
        None => optional_http_url(Some(default.to_string()), key),
    }
}

fn positive_duration(
    value: u64,
    key: &'static str,
    unit: fn(u64) -> Duration,
) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(unit(value))
}

fn at_most(value: u64, max: u64, key: &'static str) -> Result<u64, LoadError> {
    if value > max {
        return Err(LoadError::invalid(key, format!("must not exceed {max}")));
    }
    Ok(value)
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    let value: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
