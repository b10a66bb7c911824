use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the rendergate binary.
#[derive(Debug, Parser)]
#[command(
    name = "rendergate",
    version,
    about = "Prerendering reverse proxy for crawlers"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "RENDERGATE_CONFIG_FILE",
        value_name = "PATH",
        value_hint = ValueHint::FilePath
    )]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the prerendering proxy.
    Serve(Box<ServeArgs>),
    /// Render URLs through the worker pool and print a summary.
    Render(RenderArgs),
    /// Delete cache entries whose key matches a glob pattern.
    Invalidate(InvalidateArgs),
    /// Compile a policy document and report what it contains.
    #[command(name = "check-policy")]
    CheckPolicy(CheckPolicyArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct EngineOverrides {
    /// Override the browser engine endpoint.
    #[arg(long = "render-engine-url", value_name = "URL")]
    pub engine_url: Option<String>,

    /// Override the maximum number of concurrent browser sessions.
    #[arg(long = "render-max-concurrency", value_name = "COUNT")]
    pub max_concurrency: Option<u64>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct CacheOverride {
    /// Override the networked cache backend URL.
    #[arg(long = "cache-redis-url", value_name = "URL")]
    pub redis_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub engine: EngineOverrides,

    #[command(flatten)]
    pub cache: CacheOverride,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Trust the first `X-Forwarded-For` entry as the client address.
    #[arg(
        long = "server-trust-forwarded-for",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub trust_forwarded_for: Option<bool>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the origin server URL.
    #[arg(long = "origin-url", value_name = "URL")]
    pub origin_url: Option<String>,

    /// Override the policy document path.
    #[arg(long = "policy-file", value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub policy_file: Option<PathBuf>,
}

#[derive(Debug, Args, Clone)]
pub struct RenderArgs {
    #[command(flatten)]
    pub engine: EngineOverrides,

    #[command(flatten)]
    pub cache: CacheOverride,

    /// URLs to render.
    #[arg(value_name = "URL", required = true, value_hint = ValueHint::Url)]
    pub urls: Vec<String>,

    /// Maximum number of URLs rendered at once.
    #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(usize))]
    pub concurrency: usize,

    /// Write successful renders into the cache store.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub store: bool,
}

#[derive(Debug, Args, Clone)]
pub struct InvalidateArgs {
    #[command(flatten)]
    pub cache: CacheOverride,

    /// Glob pattern matched against normalized cache keys.
    #[arg(value_name = "PATTERN")]
    pub pattern: String,
}

#[derive(Debug, Args, Clone)]
pub struct CheckPolicyArgs {
    /// Policy document to compile.
    #[arg(value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub file: PathBuf,
}
