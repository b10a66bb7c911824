use serde::{Deserialize, Serialize};

use super::types::{BotAction, BotCategory};

/// Evidence gathered while classifying a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Signal {
    /// A crawler token from the user-agent catalog.
    UserAgent {
        token: String,
        category: BotCategory,
    },
    /// Source address lies in a published cloud/CDN range.
    IpRange { provider: String },
    /// A caller-supplied rule matched.
    CustomRule { rule_id: String, action: BotAction },
    /// A header could not be decoded.
    MalformedHeader { header: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub is_bot: bool,
    pub matched_signals: Vec<Signal>,
    /// Confidence in the verdict, in `0.0..=1.0`.
    pub confidence: f32,
    pub category: BotCategory,
    /// Action of the winning custom rule, if any.
    pub action: Option<BotAction>,
}

impl ClassificationResult {
    pub fn human(matched_signals: Vec<Signal>, confidence: f32) -> Self {
        Self {
            is_bot: false,
            matched_signals,
            confidence,
            category: BotCategory::Other,
            action: None,
        }
    }

    pub fn matched_rule(&self) -> Option<&str> {
        self.matched_signals.iter().find_map(|signal| match signal {
            Signal::CustomRule { rule_id, .. } => Some(rule_id.as_str()),
            _ => None,
        })
    }

    pub fn ip_provider(&self) -> Option<&str> {
        self.matched_signals.iter().find_map(|signal| match signal {
            Signal::IpRange { provider } => Some(provider.as_str()),
            _ => None,
        })
    }
}
