//! Request Classifier: decides bot versus human for each inbound request.
//!
//! Signals are gathered independently (custom rules, the crawler catalog,
//! published address ranges) and combined in a fixed order: the highest
//! priority matching custom rule wins outright, otherwise the catalog decides.
//! Address ranges only add evidence and confidence. Classification never
//! mutates shared state.

mod catalog;
mod ip_ranges;

use std::{net::IpAddr, sync::Arc};

use axum::http::{HeaderMap, header::USER_AGENT};

use crate::domain::{
    classification::{ClassificationResult, Signal},
    rules::CompiledRule,
    types::{BotAction, BotCategory},
};

pub use catalog::{CrawlerSignature, KNOWN_CRAWLERS, match_user_agent};
pub use ip_ranges::{FeedError, IpRangeSource, IpRangeTable, IpRanges, Provider, RefreshReport};

/// Compiled bot rule as consulted by the classifier.
pub type BotRuleEntry = CompiledRule<BotAction>;

const CONFIDENCE_CUSTOM_RULE: f32 = 1.0;
const CONFIDENCE_USER_AGENT: f32 = 0.85;
const CONFIDENCE_USER_AGENT_AND_IP: f32 = 0.95;
const CONFIDENCE_HUMAN: f32 = 0.9;
const CONFIDENCE_HUMAN_FROM_CLOUD: f32 = 0.6;
/// An unreadable user agent carries no evidence either way.
const CONFIDENCE_MALFORMED: f32 = 0.5;

pub struct RequestClassifier {
    ip_ranges: Option<Arc<IpRanges>>,
}

impl RequestClassifier {
    pub fn new(ip_ranges: Option<Arc<IpRanges>>) -> Self {
        Self { ip_ranges }
    }

    /// Classifier without address-range evidence.
    pub fn user_agent_only() -> Self {
        Self::new(None)
    }

    /// Classify a request from its headers and source address. `rules` must be
    /// ordered highest priority first.
    pub fn classify(
        &self,
        headers: &HeaderMap,
        source_ip: Option<IpAddr>,
        rules: &[BotRuleEntry],
    ) -> ClassificationResult {
        let mut signals = Vec::new();

        let user_agent = match headers.get(USER_AGENT).map(|value| value.to_str()) {
            Some(Ok(agent)) => Some(agent),
            Some(Err(_)) => {
                signals.push(Signal::MalformedHeader {
                    header: USER_AGENT.as_str().to_string(),
                });
                None
            }
            None => None,
        };
        let malformed = !signals.is_empty();

        let provider = match (&self.ip_ranges, source_ip) {
            (Some(ranges), Some(ip)) => ranges.lookup(ip),
            _ => None,
        };
        if let Some(provider) = provider {
            signals.push(Signal::IpRange {
                provider: provider.as_str().to_string(),
            });
        }

        let catalog_match = user_agent.and_then(match_user_agent);
        let category = catalog_match.map_or(BotCategory::Other, |signature| signature.category);

        if let Some(rule) = rules
            .iter()
            .find(|rule| rule.rule.matches_client(user_agent, source_ip))
        {
            signals.push(Signal::CustomRule {
                rule_id: rule.id.clone(),
                action: rule.action,
            });
            return ClassificationResult {
                is_bot: rule.action != BotAction::Allow,
                matched_signals: signals,
                confidence: CONFIDENCE_CUSTOM_RULE,
                category,
                action: Some(rule.action),
            };
        }

        if malformed {
            return ClassificationResult::human(signals, CONFIDENCE_MALFORMED);
        }

        match catalog_match {
            Some(signature) => {
                signals.push(Signal::UserAgent {
                    token: signature.token.to_string(),
                    category: signature.category,
                });
                ClassificationResult {
                    is_bot: true,
                    matched_signals: signals,
                    confidence: if provider.is_some() {
                        CONFIDENCE_USER_AGENT_AND_IP
                    } else {
                        CONFIDENCE_USER_AGENT
                    },
                    category: signature.category,
                    action: None,
                }
            }
            None if provider.is_some() => {
                ClassificationResult::human(signals, CONFIDENCE_HUMAN_FROM_CLOUD)
            }
            None => ClassificationResult::human(signals, CONFIDENCE_HUMAN),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use axum::http::HeaderValue;

    use super::*;
    use crate::domain::rules::{BotRule, Rule, order_by_priority};
    use crate::domain::types::BotRuleKind;

    const GOOGLEBOT: &str = "Mozilla/5.0 (compatible; Googlebot/2.1)";
    const FIREFOX: &str = "Mozilla/5.0 (X11; Linux x86_64; rv:126.0) Gecko/20100101 Firefox/126.0";

    fn headers(agent: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_str(agent).expect("header"));
        headers
    }

    fn rule(id: &str, kind: BotRuleKind, pattern: &str, action: BotAction, priority: i32) -> BotRuleEntry {
        let source = BotRule {
            id: id.to_string(),
            kind,
            pattern: pattern.to_string(),
            action,
            priority,
        };
        CompiledRule {
            id: source.id.clone(),
            priority,
            rule: Rule::from_bot_rule(&source).expect("compile"),
            action,
            ttl_seconds: None,
        }
    }

    fn cloudflare_ip() -> Option<IpAddr> {
        Some(IpAddr::V4(Ipv4Addr::new(104, 16, 1, 1)))
    }

    #[test]
    fn catalog_crawler_is_a_bot() {
        let classifier = RequestClassifier::user_agent_only();
        let result = classifier.classify(&headers(GOOGLEBOT), None, &[]);
        assert!(result.is_bot);
        assert_eq!(result.category, BotCategory::SearchEngine);
        assert_eq!(result.confidence, CONFIDENCE_USER_AGENT);
        assert!(matches!(
            result.matched_signals.as_slice(),
            [Signal::UserAgent { token, .. }] if token == "googlebot"
        ));
    }

    #[test]
    fn browser_is_human() {
        let classifier = RequestClassifier::user_agent_only();
        let result = classifier.classify(&headers(FIREFOX), None, &[]);
        assert!(!result.is_bot);
        assert!(result.matched_signals.is_empty());
    }

    #[test]
    fn ip_evidence_raises_confidence_but_not_verdict() {
        let classifier = RequestClassifier::new(Some(Arc::new(IpRanges::with_static_fallback())));

        let bot = classifier.classify(&headers(GOOGLEBOT), cloudflare_ip(), &[]);
        assert!(bot.is_bot);
        assert_eq!(bot.confidence, CONFIDENCE_USER_AGENT_AND_IP);
        assert_eq!(bot.ip_provider(), Some("cloudflare"));

        let human = classifier.classify(&headers(FIREFOX), cloudflare_ip(), &[]);
        assert!(!human.is_bot);
        assert_eq!(human.confidence, CONFIDENCE_HUMAN_FROM_CLOUD);
    }

    #[test]
    fn highest_priority_custom_rule_wins() {
        let classifier = RequestClassifier::user_agent_only();
        let mut rules = vec![
            rule("render-google", BotRuleKind::UserAgent, "googlebot", BotAction::Render, 1),
            rule("allow-google", BotRuleKind::Pattern, "google.*2\\.1", BotAction::Allow, 10),
        ];
        order_by_priority(&mut rules);

        let result = classifier.classify(&headers(GOOGLEBOT), None, &rules);
        assert!(!result.is_bot);
        assert_eq!(result.action, Some(BotAction::Allow));
        assert_eq!(result.matched_rule(), Some("allow-google"));
        assert_eq!(result.confidence, CONFIDENCE_CUSTOM_RULE);
    }

    #[test]
    fn custom_rules_can_force_render_and_block() {
        let classifier = RequestClassifier::user_agent_only();
        let rules = vec![
            rule("office", BotRuleKind::Ip, "10.0.0.0/24", BotAction::Block, 5),
            rule("partner", BotRuleKind::UserAgent, "acme-fetcher", BotAction::Render, 1),
        ];

        let office = Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)));
        let blocked = classifier.classify(&headers(FIREFOX), office, &rules);
        assert_eq!(blocked.action, Some(BotAction::Block));

        let partner = classifier.classify(&headers("acme-fetcher/3.1"), None, &rules);
        assert!(partner.is_bot);
        assert_eq!(partner.action, Some(BotAction::Render));
        assert_eq!(partner.category, BotCategory::Other);
    }

    #[test]
    fn malformed_user_agent_defaults_to_human() {
        let classifier = RequestClassifier::user_agent_only();
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_bytes(b"Googlebot \xff\xfe").expect("opaque bytes"),
        );

        let result = classifier.classify(&headers, None, &[]);
        assert!(!result.is_bot);
        assert!(matches!(
            result.matched_signals.as_slice(),
            [Signal::MalformedHeader { header }] if header == "user-agent"
        ));
        assert_eq!(result.confidence, CONFIDENCE_MALFORMED);
    }

    #[test]
    fn missing_user_agent_is_human() {
        let classifier = RequestClassifier::user_agent_only();
        let result = classifier.classify(&HeaderMap::new(), None, &[]);
        assert!(!result.is_bot);
        assert_eq!(result.confidence, CONFIDENCE_HUMAN);
    }
}
