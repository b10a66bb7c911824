//! Resource Interceptor: filters the sub-requests a page issues while it
//! renders.
//!
//! A sub-request is blocked when any of these holds:
//!
//! 1. its host sits under a custom or built-in blocked domain that no custom
//!    `allow` domain covers;
//! 2. its path matches a custom `url-pattern` block or a built-in tracker
//!    path;
//! 3. its resource type is blocked by category and not allowlisted.
//!
//! An `allow` rule lifts blocks of its own kind only: domains lift domains,
//! resource types lift categories. The main document is never blocked, and
//! content-critical types (scripts, XHR, fetch) are never blocked by
//! category. Engines that filter on their side receive the same rules as
//! [`ResourceInterceptor::reject_pattern`] and
//! [`ResourceInterceptor::rejected_resource_types`].

use tracing::warn;
use url::Url;

use crate::domain::{
    pattern::{PatternKind, UrlPattern},
    rules::BlockRule,
    types::{BlockAction, BlockMatchKind, ResourceType},
};

/// Analytics, advertising and social-widget hosts.
pub const BLOCKED_DOMAINS: &[&str] = &[
    "google-analytics.com",
    "googletagmanager.com",
    "googlesyndication.com",
    "googleadservices.com",
    "doubleclick.net",
    "adservice.google.com",
    "facebook.net",
    "connect.facebook.net",
    "hotjar.com",
    "mixpanel.com",
    "segment.io",
    "segment.com",
    "amplitude.com",
    "fullstory.com",
    "clarity.ms",
    "newrelic.com",
    "nr-data.net",
    "intercom.io",
    "intercomcdn.com",
    "zdassets.com",
    "hubspot.com",
    "hs-analytics.net",
    "taboola.com",
    "outbrain.com",
    "criteo.com",
    "adnxs.com",
    "scorecardresearch.com",
    "quantserve.com",
    "platform.twitter.com",
    "platform.linkedin.com",
    "addthis.com",
    "sharethis.com",
    "disqus.com",
];

/// Path fragments of common tracker scripts served from any host.
pub const TRACKER_PATHS: &[&str] = &[
    "/gtag/js",
    "/gtm.js",
    "/analytics.js",
    "/ga.js",
    "/fbevents.js",
    "/pixel.js",
    "/hotjar-",
    "/beacon.js",
    "/collect?",
];

/// Categories blocked unless allowlisted.
pub const BLOCKED_TYPES: &[ResourceType] = &[
    ResourceType::Image,
    ResourceType::Stylesheet,
    ResourceType::Font,
    ResourceType::Media,
    ResourceType::WebSocket,
    ResourceType::EventSource,
];

#[derive(Debug, Clone, Default)]
pub struct ResourceInterceptor {
    allowed_domains: Vec<String>,
    blocked_domains: Vec<String>,
    blocked_paths: Vec<UrlPattern>,
    blocked_types: Vec<ResourceType>,
    allowed_types: Vec<ResourceType>,
}

impl ResourceInterceptor {
    /// Interceptor using only the built-in lists.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from policy `block_rules` and the render profile's allowlisted
    /// types. Rules that cannot be compiled are skipped with a warning.
    pub fn with_rules(rules: &[BlockRule], allow_types: &[ResourceType]) -> Self {
        let mut interceptor = Self::default();
        for kind in allow_types {
            push_unique(&mut interceptor.allowed_types, *kind);
        }

        for rule in rules {
            if let Err(reason) = interceptor.add_rule(rule) {
                warn!(
                    target = "rendergate::interceptor",
                    pattern = %rule.pattern,
                    reason = %reason,
                    "Skipping block rule"
                );
            }
        }
        interceptor
    }

    fn add_rule(&mut self, rule: &BlockRule) -> Result<(), String> {
        let pattern = rule.pattern.trim();
        if pattern.is_empty() {
            return Err("pattern is empty".to_string());
        }

        match (rule.match_kind, rule.action) {
            (BlockMatchKind::Domain, action) => {
                let domain = pattern.trim_start_matches('.').to_ascii_lowercase();
                if domain.is_empty() || domain.contains(['/', '*', ':']) {
                    return Err(format!("`{pattern}` is not a domain"));
                }
                match action {
                    BlockAction::Allow => self.allowed_domains.push(domain),
                    BlockAction::Block => self.blocked_domains.push(domain),
                }
            }
            (BlockMatchKind::UrlPattern, BlockAction::Allow) => {
                return Err("url-pattern rules can only block".to_string());
            }
            (BlockMatchKind::UrlPattern, BlockAction::Block) => {
                let parsed = UrlPattern::parse(pattern).map_err(|err| err.to_string())?;
                if parsed.kind() == PatternKind::Regex {
                    return Err("regular expressions are not supported in block rules".to_string());
                }
                self.blocked_paths.push(parsed);
            }
            (BlockMatchKind::ResourceType, action) => {
                let kind = pattern
                    .parse::<ResourceType>()
                    .map_err(|err| err.to_string())?;
                match action {
                    BlockAction::Allow => push_unique(&mut self.allowed_types, kind),
                    BlockAction::Block if kind.is_content_critical() => {
                        return Err(format!("`{kind}` requests are never blocked by type"));
                    }
                    BlockAction::Block => push_unique(&mut self.blocked_types, kind),
                }
            }
        }
        Ok(())
    }

    pub fn should_allow(&self, request_url: &str, resource_type: ResourceType) -> bool {
        if resource_type == ResourceType::Document {
            return true;
        }

        let Ok(url) = Url::parse(request_url) else {
            // data: and blob: URLs never leave the page.
            return true;
        };
        let host = url.host_str().unwrap_or_default().to_ascii_lowercase();

        let host_allowed = self
            .allowed_domains
            .iter()
            .any(|allowed| domain_matches(&host, allowed));
        if !host_allowed
            && self
                .domain_blocklist()
                .any(|domain| domain_matches(&host, domain))
        {
            return false;
        }

        if self
            .blocked_paths
            .iter()
            .any(|pattern| pattern.matches(Some(&host), url.path()))
        {
            return false;
        }
        let path_and_query = match url.query() {
            Some(query) => format!("{}?{query}", url.path()),
            None => url.path().to_string(),
        };
        if TRACKER_PATHS
            .iter()
            .any(|fragment| path_and_query.contains(fragment))
        {
            return false;
        }

        !self.blocks_type(resource_type)
    }

    /// Regular expression over whole request URLs matching every domain and
    /// path block, for engines that filter by pattern.
    ///
    /// A blocked domain with only part of it allowed (`allow
    /// static.hotjar.com` under the built-in `hotjar.com`) cannot be carved
    /// out without look-around, so the whole domain is left out here and only
    /// [`ResourceInterceptor::should_allow`] enforces it.
    pub fn reject_pattern(&self) -> String {
        let domains = self
            .domain_blocklist()
            .filter(|domain| {
                !self.allowed_domains.iter().any(|allowed| {
                    domain_matches(domain, allowed) || domain_matches(allowed, domain)
                })
            })
            .map(|domain| {
                format!(
                    r"^[a-zA-Z][a-zA-Z0-9+.-]*://(?i:(?:[^/?#]*\.)?{})(?::[0-9]+)?(?:[/?#].*)?$",
                    regex::escape(domain)
                )
            });
        let paths = self
            .blocked_paths
            .iter()
            .filter_map(UrlPattern::url_expression);
        let trackers = TRACKER_PATHS.iter().map(|fragment| {
            format!(
                r"^[a-zA-Z][a-zA-Z0-9+.-]*://[^/?#]*[^#]*{}",
                regex::escape(fragment)
            )
        });

        domains
            .chain(paths)
            .chain(trackers)
            .map(|alternative| format!("(?:{alternative})"))
            .collect::<Vec<_>>()
            .join("|")
    }

    /// Resource types blocked by category for this profile.
    pub fn rejected_resource_types(&self) -> Vec<ResourceType> {
        ResourceType::ALL
            .into_iter()
            .filter(|kind| self.blocks_type(*kind))
            .collect()
    }

    fn blocks_type(&self, kind: ResourceType) -> bool {
        !kind.is_content_critical()
            && (BLOCKED_TYPES.contains(&kind) || self.blocked_types.contains(&kind))
            && !self.allowed_types.contains(&kind)
    }

    /// Custom blocked domains followed by the built-in list.
    fn domain_blocklist(&self) -> impl Iterator<Item = &str> {
        self.blocked_domains
            .iter()
            .map(String::as_str)
            .chain(BLOCKED_DOMAINS.iter().copied())
    }
}

fn push_unique(kinds: &mut Vec<ResourceType>, kind: ResourceType) {
    if !kinds.contains(&kind) {
        kinds.push(kind);
    }
}

/// `host` equals `suffix` or is a subdomain of it.
fn domain_matches(host: &str, suffix: &str) -> bool {
    host == suffix
        || host
            .strip_suffix(suffix)
            .is_some_and(|prefix| prefix.ends_with('.'))
}
