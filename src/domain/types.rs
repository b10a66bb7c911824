//! Shared domain enumerations used across rules, classification and outcomes.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use super::error::DomainError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BotCategory {
    SearchEngine,
    Social,
    Monitoring,
    Other,
}

impl BotCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            BotCategory::SearchEngine => "search-engine",
            BotCategory::Social => "social",
            BotCategory::Monitoring => "monitoring",
            BotCategory::Other => "other",
        }
    }
}

/// Action attached to a caller-supplied classification rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BotAction {
    /// Treat the client as human and pass through.
    Allow,
    /// Refuse the request outright.
    Block,
    /// Treat the client as a bot and serve rendered content.
    Render,
    /// Pass through, flagging the request so the origin may challenge it.
    Challenge,
}

impl BotAction {
    pub fn as_str(self) -> &'static str {
        match self {
            BotAction::Allow => "allow",
            BotAction::Block => "block",
            BotAction::Render => "render",
            BotAction::Challenge => "challenge",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BotRuleKind {
    UserAgent,
    Ip,
    Pattern,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleScope {
    NoCache,
    CacheOnly,
}

impl RuleScope {
    pub fn as_str(self) -> &'static str {
        match self {
            RuleScope::NoCache => "no-cache",
            RuleScope::CacheOnly => "cache-only",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockMatchKind {
    Domain,
    UrlPattern,
    ResourceType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockAction {
    Block,
    Allow,
}

/// Category of a sub-request issued by a page while it renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Document,
    Script,
    Xhr,
    Fetch,
    Image,
    Stylesheet,
    Font,
    Media,
    WebSocket,
    EventSource,
    Other,
}

impl ResourceType {
    pub const ALL: [ResourceType; 11] = [
        ResourceType::Document,
        ResourceType::Script,
        ResourceType::Xhr,
        ResourceType::Fetch,
        ResourceType::Image,
        ResourceType::Stylesheet,
        ResourceType::Font,
        ResourceType::Media,
        ResourceType::WebSocket,
        ResourceType::EventSource,
        ResourceType::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceType::Document => "document",
            ResourceType::Script => "script",
            ResourceType::Xhr => "xhr",
            ResourceType::Fetch => "fetch",
            ResourceType::Image => "image",
            ResourceType::Stylesheet => "stylesheet",
            ResourceType::Font => "font",
            ResourceType::Media => "media",
            ResourceType::WebSocket => "websocket",
            ResourceType::EventSource => "eventsource",
            ResourceType::Other => "other",
        }
    }

    /// Types that carry the page's content and are never blocked by category.
    pub fn is_content_critical(self) -> bool {
        matches!(
            self,
            ResourceType::Document | ResourceType::Script | ResourceType::Xhr | ResourceType::Fetch
        )
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        ResourceType::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| DomainError::validation(format!("unknown resource type `{value}`")))
    }
}

/// Cache state reported to callers and in diagnostic headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    Fresh,
    Stale,
    Miss,
    Bypass,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Fresh => "fresh",
            CacheStatus::Stale => "stale",
            CacheStatus::Miss => "miss",
            CacheStatus::Bypass => "bypass",
        }
    }
}

/// Terminal routing outcome of a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeAction {
    Render,
    Proxy,
    Fallback,
    Block,
    Error,
}

impl OutcomeAction {
    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeAction::Render => "render",
            OutcomeAction::Proxy => "proxy",
            OutcomeAction::Fallback => "fallback",
            OutcomeAction::Block => "block",
            OutcomeAction::Error => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_type_parses_case_insensitively() {
        assert_eq!(
            "WebSocket".parse::<ResourceType>().expect("parse"),
            ResourceType::WebSocket
        );
        assert_eq!(
            " image ".parse::<ResourceType>().expect("parse"),
            ResourceType::Image
        );
        assert!("gif".parse::<ResourceType>().is_err());
    }

    #[test]
    fn content_critical_types() {
        assert!(ResourceType::Document.is_content_critical());
        assert!(ResourceType::Fetch.is_content_critical());
        assert!(!ResourceType::Font.is_content_critical());
    }

    #[test]
    fn scope_uses_kebab_case_on_the_wire() {
        let scope: RuleScope = serde_json::from_str("\"no-cache\"").expect("deserialize");
        assert_eq!(scope, RuleScope::NoCache);
        assert_eq!(RuleScope::CacheOnly.as_str(), "cache-only");
    }
}
