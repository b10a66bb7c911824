//! Cache Decision Engine.
//!
//! A pure function of `(url, ruleset, content)`. The pre-render phase looks at
//! the URL only; the post-render phase additionally lets a meta marker in the
//! rendered document opt a page out of caching. The marker never opts a page
//! in and never changes whether it is rendered.

use std::{cell::RefCell, rc::Rc};

use lol_html::{RewriteStrSettings, element, rewrite_str};
use serde::Serialize;
use tracing::warn;
use url::Url;

use crate::{
    cache::MAX_TTL_SECONDS,
    domain::{
        decision::CacheDecision,
        rules::{CacheRule, CompiledRule, Rule, order_by_priority},
        types::RuleScope,
    },
};

pub const DEFAULT_OVERRIDE_META: &str = "x-cache";
pub const DEFAULT_TTL_SECONDS: u64 = 86_400;

/// Global defaults applied when no rule decides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionDefaults {
    pub cache_by_default: bool,
    pub default_ttl_seconds: u64,
    /// `name` of the meta element whose `content` overrides caching.
    pub override_meta: String,
}

impl Default for DecisionDefaults {
    fn default() -> Self {
        Self {
            cache_by_default: true,
            default_ttl_seconds: DEFAULT_TTL_SECONDS,
            override_meta: DEFAULT_OVERRIDE_META.to_string(),
        }
    }
}

/// A rule left out of a compiled set, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedRule {
    pub id: String,
    pub reason: String,
}

/// Compiled cache rules, each scope ordered highest priority first.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    no_cache: Vec<CompiledRule>,
    cache_only: Vec<CompiledRule>,
    defaults: DecisionDefaults,
}

impl RuleSet {
    /// Compile `rules`, skipping (and logging) any whose pattern is invalid.
    pub fn compile(rules: &[CacheRule], defaults: DecisionDefaults) -> (Self, Vec<SkippedRule>) {
        let mut no_cache = Vec::new();
        let mut cache_only = Vec::new();
        let mut skipped = Vec::new();

        for source in rules {
            if let Some(ttl) = source.ttl_seconds.filter(|ttl| *ttl > MAX_TTL_SECONDS) {
                warn!(
                    target = "rendergate::decision",
                    rule_id = %source.id,
                    ttl_seconds = ttl,
                    max_ttl_seconds = MAX_TTL_SECONDS,
                    "Skipping cache rule with out-of-range TTL"
                );
                skipped.push(SkippedRule {
                    id: source.id.clone(),
                    reason: format!("ttl_seconds {ttl} exceeds the maximum of {MAX_TTL_SECONDS}"),
                });
                continue;
            }

            let rule = match Rule::from_cache_rule(source) {
                Ok(rule) => rule,
                Err(err) => {
                    warn!(
                        target = "rendergate::decision",
                        rule_id = %source.id,
                        pattern = %source.pattern,
                        error = %err,
                        "Skipping cache rule with invalid pattern"
                    );
                    skipped.push(SkippedRule {
                        id: source.id.clone(),
                        reason: err.to_string(),
                    });
                    continue;
                }
            };

            let compiled = CompiledRule {
                id: source.id.clone(),
                priority: source.priority,
                rule,
                action: (),
                ttl_seconds: source.ttl_seconds,
            };
            match source.scope {
                RuleScope::NoCache => no_cache.push(compiled),
                RuleScope::CacheOnly => cache_only.push(compiled),
            }
        }

        order_by_priority(&mut no_cache);
        order_by_priority(&mut cache_only);

        (
            Self {
                no_cache,
                cache_only,
                defaults,
            },
            skipped,
        )
    }

    pub fn defaults(&self) -> &DecisionDefaults {
        &self.defaults
    }

    pub fn len(&self) -> usize {
        self.no_cache.len() + self.cache_only.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when cache-only rules restrict caching to their matches.
    pub fn is_whitelist(&self) -> bool {
        !self.cache_only.is_empty()
    }
}

/// Evaluate `url` against `ruleset`. With `content`, the rendered document's
/// override marker may withdraw `should_cache` from a renderable page; it
/// never grants caching the rules did not.
pub fn decide(url: &Url, ruleset: &RuleSet, content: Option<&str>) -> CacheDecision {
    let decision = decide_pre_render(url, ruleset);
    match content {
        Some(html) if decision.should_render => apply_override(decision, ruleset, html),
        _ => decision,
    }
}

fn decide_pre_render(url: &Url, ruleset: &RuleSet) -> CacheDecision {
    let host = url.host_str();
    let path = url.path();
    let defaults = &ruleset.defaults;

    if let Some(rule) = first_match(&ruleset.no_cache, host, path) {
        return CacheDecision {
            should_render: false,
            should_cache: false,
            ttl_seconds: 0,
            reason: "matched no-cache rule".to_string(),
            matched_rule_id: Some(rule.id.clone()),
        };
    }

    if ruleset.is_whitelist() {
        return match first_match(&ruleset.cache_only, host, path) {
            Some(rule) => CacheDecision {
                should_render: true,
                should_cache: true,
                ttl_seconds: rule.ttl_seconds.unwrap_or(defaults.default_ttl_seconds),
                reason: "matched cache-only rule".to_string(),
                matched_rule_id: Some(rule.id.clone()),
            },
            None => CacheDecision {
                should_render: defaults.cache_by_default,
                should_cache: false,
                ttl_seconds: 0,
                reason: "not in cache-only list".to_string(),
                matched_rule_id: None,
            },
        };
    }

    CacheDecision {
        should_render: defaults.cache_by_default,
        should_cache: defaults.cache_by_default,
        ttl_seconds: if defaults.cache_by_default {
            defaults.default_ttl_seconds
        } else {
            0
        },
        reason: if defaults.cache_by_default {
            "cache by default".to_string()
        } else {
            "caching disabled by default".to_string()
        },
        matched_rule_id: None,
    }
}

fn first_match<'a>(
    rules: &'a [CompiledRule],
    host: Option<&str>,
    path: &str,
) -> Option<&'a CompiledRule> {
    rules.iter().find(|rule| rule.rule.matches_url(host, path))
}

fn apply_override(mut decision: CacheDecision, ruleset: &RuleSet, html: &str) -> CacheDecision {
    if !decision.should_cache {
        return decision;
    }
    if find_override(html, &ruleset.defaults.override_meta) == Some(false) {
        decision.should_cache = false;
        decision.ttl_seconds = 0;
        decision.reason = "content override disabled caching".to_string();
    }
    decision
}

/// Value of the first `<meta name="{name}" content="true|false">` in `html`.
/// Other `content` values are ignored.
pub fn find_override(html: &str, name: &str) -> Option<bool> {
    let found: Rc<RefCell<Option<bool>>> = Rc::new(RefCell::new(None));

    let scan = rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: vec![element!("meta[name][content]", {
                let found = Rc::clone(&found);
                move |el| {
                    if found.borrow().is_some() {
                        return Ok(());
                    }
                    let matches_name = el
                        .get_attribute("name")
                        .is_some_and(|value| value.trim().eq_ignore_ascii_case(name));
                    if !matches_name {
                        return Ok(());
                    }
                    let value = el
                        .get_attribute("content")
                        .map(|value| value.trim().to_ascii_lowercase());
                    *found.borrow_mut() = match value.as_deref() {
                        Some("true") => Some(true),
                        Some("false") => Some(false),
                        _ => None,
                    };
                    Ok(())
                }
            })],
            ..RewriteStrSettings::default()
        },
    );

    if let Err(err) = scan {
        warn!(
            target = "rendergate::decision",
            error = %err,
            "Rendered document could not be scanned for cache override"
        );
        return None;
    }

    let value = *found.borrow();
    value
}
