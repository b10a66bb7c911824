//! Rule definitions as they arrive from policy documents, and their compiled
//! tagged form used at evaluation time.

use std::net::IpAddr;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use super::{
    cidr::Ipv4Cidr,
    error::DomainError,
    pattern::UrlPattern,
    types::{BlockAction, BlockMatchKind, BotAction, BotRuleKind, RuleScope},
};

/// Per-URL caching rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRule {
    pub id: String,
    pub pattern: String,
    pub scope: RuleScope,
    #[serde(default)]
    pub priority: i32,
    /// Overrides the default TTL when this rule admits a page into the cache.
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
}

/// Caller-supplied classification rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotRule {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: BotRuleKind,
    pub pattern: String,
    pub action: BotAction,
    #[serde(default)]
    pub priority: i32,
}

/// Sub-request filter consulted by the resource interceptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRule {
    #[serde(rename = "match")]
    pub match_kind: BlockMatchKind,
    pub pattern: String,
    pub action: BlockAction,
}

/// Compiled rule variant; evaluation matches on it exhaustively.
#[derive(Debug, Clone)]
pub enum Rule {
    NoCache(UrlPattern),
    CacheOnly(UrlPattern),
    /// Lowercased substring searched in the user agent.
    UserAgentMatch(String),
    UserAgentPattern(Regex),
    CidrMatch(Ipv4Cidr),
}

impl Rule {
    pub fn from_cache_rule(rule: &CacheRule) -> Result<Self, DomainError> {
        let pattern = UrlPattern::parse(&rule.pattern)?;
        Ok(match rule.scope {
            RuleScope::NoCache => Rule::NoCache(pattern),
            RuleScope::CacheOnly => Rule::CacheOnly(pattern),
        })
    }

    pub fn from_bot_rule(rule: &BotRule) -> Result<Self, DomainError> {
        let pattern = rule.pattern.trim();
        if pattern.is_empty() {
            return Err(DomainError::invalid_pattern(&rule.pattern, "pattern is empty"));
        }
        match rule.kind {
            BotRuleKind::UserAgent => Ok(Rule::UserAgentMatch(pattern.to_ascii_lowercase())),
            BotRuleKind::Pattern => RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map(Rule::UserAgentPattern)
                .map_err(|err| DomainError::invalid_pattern(pattern, err.to_string())),
            BotRuleKind::Ip => pattern
                .parse::<Ipv4Cidr>()
                .map(Rule::CidrMatch)
                .map_err(|err| DomainError::invalid_pattern(pattern, err.to_string())),
        }
    }

    pub fn matches_url(&self, host: Option<&str>, path: &str) -> bool {
        match self {
            Rule::NoCache(pattern) | Rule::CacheOnly(pattern) => pattern.matches(host, path),
            Rule::UserAgentMatch(_) | Rule::UserAgentPattern(_) | Rule::CidrMatch(_) => false,
        }
    }

    pub fn matches_client(&self, user_agent: Option<&str>, ip: Option<IpAddr>) -> bool {
        match self {
            Rule::UserAgentMatch(needle) => {
                user_agent.is_some_and(|agent| agent.to_ascii_lowercase().contains(needle))
            }
            Rule::UserAgentPattern(regex) => user_agent.is_some_and(|agent| regex.is_match(agent)),
            Rule::CidrMatch(block) => ip.is_some_and(|ip| block.contains_ip(ip)),
            Rule::NoCache(_) | Rule::CacheOnly(_) => false,
        }
    }

    pub fn scope(&self) -> Option<RuleScope> {
        match self {
            Rule::NoCache(_) => Some(RuleScope::NoCache),
            Rule::CacheOnly(_) => Some(RuleScope::CacheOnly),
            Rule::UserAgentMatch(_) | Rule::UserAgentPattern(_) | Rule::CidrMatch(_) => None,
        }
    }
}

/// A compiled rule with the metadata needed to order and report it.
#[derive(Debug, Clone)]
pub struct CompiledRule<A = ()> {
    pub id: String,
    pub priority: i32,
    pub rule: Rule,
    pub action: A,
    pub ttl_seconds: Option<u64>,
}

/// Sort highest priority first; equal priorities keep declaration order.
pub fn order_by_priority<A>(rules: &mut [CompiledRule<A>]) {
    rules.sort_by(|left, right| right.priority.cmp(&left.priority));
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    fn bot_rule(kind: BotRuleKind, pattern: &str) -> BotRule {
        BotRule {
            id: "r".to_string(),
            kind,
            pattern: pattern.to_string(),
            action: BotAction::Render,
            priority: 0,
        }
    }

    #[test]
    fn user_agent_rules_match_case_insensitively() {
        let rule = Rule::from_bot_rule(&bot_rule(BotRuleKind::UserAgent, "AcmeCrawler"))
            .expect("compile");
        assert!(rule.matches_client(Some("Mozilla/5.0 acmecrawler/1.0"), None));
        assert!(!rule.matches_client(None, None));
    }

    #[test]
    fn ip_rules_use_cidr_containment() {
        let rule =
            Rule::from_bot_rule(&bot_rule(BotRuleKind::Ip, "10.0.0.0/24")).expect("compile");
        let inside = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5));
        let outside = IpAddr::V4(Ipv4Addr::new(10, 0, 1, 5));
        assert!(rule.matches_client(None, Some(inside)));
        assert!(!rule.matches_client(None, Some(outside)));
    }

    #[test]
    fn invalid_bot_pattern_is_reported() {
        let err = Rule::from_bot_rule(&bot_rule(BotRuleKind::Pattern, "(")).expect_err("invalid");
        assert!(matches!(err, DomainError::InvalidPattern { .. }));
    }

    #[test]
    fn cache_rules_compile_to_scoped_variants() {
        let rule = Rule::from_cache_rule(&CacheRule {
            id: "checkout".to_string(),
            pattern: "/checkout".to_string(),
            scope: RuleScope::NoCache,
            priority: 1,
            ttl_seconds: None,
        })
        .expect("compile");
        assert_eq!(rule.scope(), Some(RuleScope::NoCache));
        assert!(rule.matches_url(None, "/checkout"));
        assert!(!rule.matches_client(Some("/checkout"), None));
    }

    #[test]
    fn priority_order_is_stable() {
        let make = |id: &str, priority| CompiledRule {
            id: id.to_string(),
            priority,
            rule: Rule::UserAgentMatch(id.to_string()),
            action: (),
            ttl_seconds: None,
        };
        let mut rules = vec![make("a", 1), make("b", 5), make("c", 1), make("d", 5)];
        order_by_priority(&mut rules);
        let ids: Vec<_> = rules.iter().map(|rule| rule.id.as_str()).collect();
        assert_eq!(ids, ["b", "d", "a", "c"]);
    }

    #[test]
    fn policy_wire_names() {
        let rule: BotRule = toml::from_str(
            r#"
            id = "monitor"
            type = "user-agent"
            pattern = "uptime"
            action = "challenge"
            "#,
        )
        .expect("deserialize");
        assert_eq!(rule.kind, BotRuleKind::UserAgent);
        assert_eq!(rule.action, BotAction::Challenge);
        assert_eq!(rule.priority, 0);

        let block: BlockRule = toml::from_str(
            r#"
            match = "resource-type"
            pattern = "font"
            action = "allow"
            "#,
        )
        .expect("deserialize");
        assert_eq!(block.match_kind, BlockMatchKind::ResourceType);
    }
}
