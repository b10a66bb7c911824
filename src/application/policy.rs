//! Hot-reloadable rule policy.
//!
//! Cache rules, bot rules, block rules and the decision defaults come from a
//! TOML document. Requests read the current [`PolicySnapshot`] through a
//! [`PolicyHandle`]; a reload compiles a complete new snapshot and swaps it in
//! with a single write, so a request never observes a half-applied policy.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    application::{
        classifier::BotRuleEntry,
        decision::{DEFAULT_OVERRIDE_META, DEFAULT_TTL_SECONDS, DecisionDefaults, RuleSet, SkippedRule},
        interceptor::ResourceInterceptor,
    },
    cache::{
        MAX_TTL_SECONDS,
        lock::{mutex_lock, rw_read, rw_write},
    },
    domain::{
        rules::{BlockRule, BotRule, CacheRule, CompiledRule, Rule, order_by_priority},
        types::ResourceType,
    },
};

const SOURCE: &str = "application::policy";

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("failed to read policy `{path}`: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse policy: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Settings-derived values a policy document falls back on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyBaseline {
    /// Resource types the render profile always lets through.
    pub allow_types: Vec<ResourceType>,
    pub default_ttl_seconds: u64,
}

impl Default for PolicyBaseline {
    fn default() -> Self {
        Self {
            allow_types: Vec::new(),
            default_ttl_seconds: DEFAULT_TTL_SECONDS,
        }
    }
}

/// Pool sizing as declared in the policy. Only read at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSizing {
    pub max_concurrency: usize,
}

/// Policy document as written by operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyDocument {
    pub cache_by_default: bool,
    pub override_meta: String,
    /// Falls back to the cache TTL from settings.
    pub default_ttl_seconds: Option<u64>,
    pub cache_rules: Vec<CacheRule>,
    pub bot_rules: Vec<BotRule>,
    pub block_rules: Vec<BlockRule>,
    pub pool: Option<PoolSizing>,
}

impl Default for PolicyDocument {
    fn default() -> Self {
        Self {
            cache_by_default: true,
            override_meta: DEFAULT_OVERRIDE_META.to_string(),
            default_ttl_seconds: None,
            cache_rules: Vec::new(),
            bot_rules: Vec::new(),
            block_rules: Vec::new(),
            pool: None,
        }
    }
}

impl PolicyDocument {
    pub fn parse(source: &str) -> Result<Self, PolicyError> {
        Ok(toml::from_str(source)?)
    }

    pub async fn read(path: &Path) -> Result<(Self, String), PolicyError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| PolicyError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let document = Self::parse(&text)?;
        Ok((document, text))
    }

    fn defaults(&self, baseline: &PolicyBaseline) -> DecisionDefaults {
        let override_meta = self.override_meta.trim();
        let default_ttl_seconds = match self.default_ttl_seconds {
            Some(ttl) if ttl > MAX_TTL_SECONDS => {
                warn!(
                    target = "rendergate::policy",
                    ttl_seconds = ttl,
                    max_ttl_seconds = MAX_TTL_SECONDS,
                    "Ignoring out-of-range default_ttl_seconds"
                );
                baseline.default_ttl_seconds
            }
            Some(ttl) => ttl,
            None => baseline.default_ttl_seconds,
        };
        DecisionDefaults {
            cache_by_default: self.cache_by_default,
            default_ttl_seconds,
            override_meta: if override_meta.is_empty() {
                DEFAULT_OVERRIDE_META.to_string()
            } else {
                override_meta.to_string()
            },
        }
    }
}

/// Compiled, immutable view of one policy revision.
#[derive(Debug, Clone, Default)]
pub struct PolicySnapshot {
    pub rules: RuleSet,
    /// Ordered highest priority first.
    pub bot_rules: Vec<BotRuleEntry>,
    pub interceptor: Arc<ResourceInterceptor>,
    /// Rules left out because they failed to compile.
    pub skipped: Vec<SkippedRule>,
    pub block_rule_count: usize,
}

impl PolicySnapshot {
    /// Compile `document`. Invalid rules are skipped and reported in `skipped`.
    pub fn compile(document: &PolicyDocument, baseline: &PolicyBaseline) -> Self {
        let (rules, mut skipped) =
            RuleSet::compile(&document.cache_rules, document.defaults(baseline));

        let mut bot_rules = Vec::with_capacity(document.bot_rules.len());
        for source in &document.bot_rules {
            match Rule::from_bot_rule(source) {
                Ok(rule) => bot_rules.push(CompiledRule {
                    id: source.id.clone(),
                    priority: source.priority,
                    rule,
                    action: source.action,
                    ttl_seconds: None,
                }),
                Err(err) => {
                    warn!(
                        target = "rendergate::policy",
                        rule_id = %source.id,
                        pattern = %source.pattern,
                        error = %err,
                        "Skipping bot rule with invalid pattern"
                    );
                    skipped.push(SkippedRule {
                        id: source.id.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }
        order_by_priority(&mut bot_rules);

        let interceptor = Arc::new(ResourceInterceptor::with_rules(
            &document.block_rules,
            &baseline.allow_types,
        ));

        Self {
            rules,
            bot_rules,
            interceptor,
            skipped,
            block_rule_count: document.block_rules.len(),
        }
    }

    pub fn rule_counts(&self) -> (usize, usize, usize) {
        (self.rules.len(), self.bot_rules.len(), self.block_rule_count)
    }
}

/// Shared access point to the current policy revision.
pub struct PolicyHandle {
    current: RwLock<Arc<PolicySnapshot>>,
    path: Option<PathBuf>,
    last_source: Mutex<Option<String>>,
    baseline: PolicyBaseline,
    startup_concurrency: usize,
}

impl PolicyHandle {
    /// Handle serving a fixed snapshot; [`PolicyHandle::reload`] is a no-op.
    pub fn fixed(snapshot: PolicySnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
            path: None,
            last_source: Mutex::new(None),
            baseline: PolicyBaseline::default(),
            startup_concurrency: 0,
        }
    }

    /// Load the policy at `path`. A missing or broken file at startup is an error.
    ///
    /// A `[pool]` section overrides `configured_concurrency`; the result is
    /// fixed for the life of the handle, see [`PolicyHandle::pool_concurrency`].
    pub async fn load(
        path: impl Into<PathBuf>,
        baseline: PolicyBaseline,
        configured_concurrency: usize,
    ) -> Result<Self, PolicyError> {
        let path = path.into();
        let (document, text) = PolicyDocument::read(&path).await?;
        let snapshot = PolicySnapshot::compile(&document, &baseline);
        let (cache, bots, blocks) = snapshot.rule_counts();
        info!(
            target = "rendergate::policy",
            path = %path.display(),
            cache_rules = cache,
            bot_rules = bots,
            block_rules = blocks,
            skipped = snapshot.skipped.len(),
            "Policy loaded"
        );
        let startup_concurrency = document
            .pool
            .as_ref()
            .filter(|pool| pool.max_concurrency > 0)
            .map_or(configured_concurrency, |pool| pool.max_concurrency);

        Ok(Self {
            current: RwLock::new(Arc::new(snapshot)),
            path: Some(path),
            last_source: Mutex::new(Some(text)),
            baseline,
            startup_concurrency,
        })
    }

    pub fn current(&self) -> Arc<PolicySnapshot> {
        Arc::clone(&rw_read(&self.current, SOURCE, "current"))
    }

    /// Worker pool size chosen at startup, or `None` for a fixed handle.
    pub fn pool_concurrency(&self) -> Option<usize> {
        (self.startup_concurrency > 0).then_some(self.startup_concurrency)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn replace(&self, snapshot: PolicySnapshot) {
        *rw_write(&self.current, SOURCE, "replace") = Arc::new(snapshot);
    }

    /// Re-read the policy file. Returns `true` when a new snapshot was swapped
    /// in, `false` when the file is unchanged. On error the previous snapshot
    /// stays active.
    pub async fn reload(&self) -> Result<bool, PolicyError> {
        let Some(path) = &self.path else {
            return Ok(false);
        };

        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| PolicyError::Read {
                path: path.clone(),
                source,
            })?;
        if mutex_lock(&self.last_source, SOURCE, "reload").as_deref() == Some(text.as_str()) {
            return Ok(false);
        }

        let document = PolicyDocument::parse(&text)?;
        let snapshot = PolicySnapshot::compile(&document, &self.baseline);
        let (cache, bots, blocks) = snapshot.rule_counts();
        check_pool_sizing(&document, self.startup_concurrency);

        self.replace(snapshot);
        *mutex_lock(&self.last_source, SOURCE, "reload") = Some(text);
        info!(
            target = "rendergate::policy",
            op = "reload",
            result = "swapped",
            cache_rules = cache,
            bot_rules = bots,
            block_rules = blocks,
            "Policy reloaded"
        );
        Ok(true)
    }

    /// Reload every `every` until the task is aborted.
    pub async fn watch(self: Arc<Self>, every: Duration) {
        let mut interval = tokio::time::interval(every.max(Duration::from_secs(1)));
        interval.tick().await;
        loop {
            interval.tick().await;
            match self.reload().await {
                Ok(true) => {}
                Ok(false) => debug!(target = "rendergate::policy", op = "reload", result = "unchanged"),
                Err(err) => warn!(
                    target = "rendergate::policy",
                    op = "reload",
                    result = "kept_previous",
                    error = %err,
                    "Policy reload failed"
                ),
            }
        }
    }
}

fn check_pool_sizing(document: &PolicyDocument, running: usize) {
    let Some(pool) = &document.pool else {
        return;
    };
    if running > 0 && pool.max_concurrency != running {
        warn!(
            target = "rendergate::policy",
            declared = pool.max_concurrency,
            running,
            "Pool sizing changed; restart to apply"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use url::Url;

    use super::*;
    use crate::application::decision::decide;

    const POLICY: &str = r#"
cache_by_default = true
override_meta = "x-cache"
default_ttl_seconds = 600

[[cache_rules]]
id = "checkout"
pattern = "/checkout*"
scope = "no-cache"
priority = 100

[[cache_rules]]
id = "broken"
pattern = "/(unclosed/"
scope = "cache-only"

[[bot_rules]]
id = "internal-monitor"
type = "user-agent"
pattern = "acme-uptime"
action = "allow"
priority = 10

[[bot_rules]]
id = "bad-ip"
type = "ip"
pattern = "10.0.0.0/99"
action = "block"

[[block_rules]]
match = "domain"
pattern = "ads.example"
action = "block"
"#;

    #[test]
    fn compiles_document_and_reports_skipped_rules() {
        let document = PolicyDocument::parse(POLICY).expect("parse");
        let snapshot = PolicySnapshot::compile(&document, &PolicyBaseline::default());

        assert_eq!(snapshot.rule_counts(), (1, 1, 1));
        let skipped: Vec<_> = snapshot.skipped.iter().map(|rule| rule.id.as_str()).collect();
        assert_eq!(skipped, ["broken", "bad-ip"]);
        assert_eq!(snapshot.rules.defaults().default_ttl_seconds, 600);

        let url = Url::parse("https://shop.example.com/checkout/step-1").expect("url");
        assert!(decide(&url, &snapshot.rules, None).is_bypass());
        assert!(!snapshot.interceptor.should_allow(
            "https://cdn.ads.example/pixel.js",
            ResourceType::Script
        ));
    }

    #[test]
    fn out_of_range_ttls_never_reach_the_cache() {
        let document = PolicyDocument::parse(
            r#"
            default_ttl_seconds = 1000000000000

            [[cache_rules]]
            id = "forever"
            pattern = "/archive/*"
            scope = "cache-only"
            ttl_seconds = 1000000000000

            [[cache_rules]]
            id = "pricing"
            pattern = "/pricing"
            scope = "cache-only"
            ttl_seconds = 300
            "#,
        )
        .expect("parse");
        let baseline = PolicyBaseline {
            allow_types: Vec::new(),
            default_ttl_seconds: 900,
        };
        let snapshot = PolicySnapshot::compile(&document, &baseline);

        let skipped: Vec<_> = snapshot.skipped.iter().map(|rule| rule.id.as_str()).collect();
        assert_eq!(skipped, ["forever"]);
        assert_eq!(snapshot.rules.defaults().default_ttl_seconds, 900);

        let archive = Url::parse("https://shop.example.com/archive/2001").expect("url");
        let decision = decide(&archive, &snapshot.rules, None);
        assert!(decision.ttl_seconds <= MAX_TTL_SECONDS);
        assert!(!decision.should_cache);

        let pricing = Url::parse("https://shop.example.com/pricing").expect("url");
        assert_eq!(decide(&pricing, &snapshot.rules, None).ttl_seconds, 300);
    }

    #[test]
    fn empty_document_uses_defaults() {
        let document = PolicyDocument::parse("").expect("parse");
        assert_eq!(document, PolicyDocument::default());
        let baseline = PolicyBaseline {
            allow_types: vec![ResourceType::Font],
            default_ttl_seconds: 120,
        };
        let snapshot = PolicySnapshot::compile(&document, &baseline);
        assert!(snapshot.rules.is_empty());
        assert!(snapshot.rules.defaults().cache_by_default);
        assert_eq!(snapshot.rules.defaults().default_ttl_seconds, 120);
        assert!(
            snapshot
                .interceptor
                .should_allow("https://cdn.example.com/a.woff2", ResourceType::Font)
        );
    }

    #[test]
    fn unknown_scope_is_a_parse_error() {
        let err = PolicyDocument::parse(
            r#"
            [[cache_rules]]
            id = "x"
            pattern = "/x"
            scope = "sometimes"
            "#,
        )
        .expect_err("invalid scope");
        assert!(matches!(err, PolicyError::Parse(_)));
    }

    #[tokio::test]
    async fn reload_swaps_only_on_valid_change() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(POLICY.as_bytes()).expect("write");
        let handle = PolicyHandle::load(file.path(), PolicyBaseline::default(), 4).await.expect("load");
        let first = handle.current();

        assert!(!handle.reload().await.expect("unchanged"));
        assert!(Arc::ptr_eq(&first, &handle.current()));

        std::fs::write(file.path(), "cache_by_default = false\n").expect("rewrite");
        assert!(handle.reload().await.expect("changed"));
        assert!(!handle.current().rules.defaults().cache_by_default);

        std::fs::write(file.path(), "cache_by_default = [").expect("break");
        assert!(handle.reload().await.is_err());
        assert!(!handle.current().rules.defaults().cache_by_default, "previous snapshot kept");
    }

    #[tokio::test]
    async fn pool_section_sets_startup_concurrency() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(b"[pool]\nmax_concurrency = 8\n").expect("write");
        let handle = PolicyHandle::load(file.path(), PolicyBaseline::default(), 4)
            .await
            .expect("load");
        assert_eq!(handle.pool_concurrency(), Some(8));

        std::fs::write(file.path(), "[pool]\nmax_concurrency = 2\n").expect("rewrite");
        assert!(handle.reload().await.expect("changed"));
        assert_eq!(handle.pool_concurrency(), Some(8), "resize needs a restart");
    }

    #[tokio::test]
    async fn missing_file_is_a_read_error() {
        let err = PolicyHandle::load(
            "/nonexistent/rendergate-policy.toml",
            PolicyBaseline::default(),
            0,
        )
            .await
            .err()
            .expect("missing file");
        assert!(matches!(err, PolicyError::Read { .. }));
    }
}
