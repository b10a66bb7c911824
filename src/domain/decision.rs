use serde::{Deserialize, Serialize};

/// Verdict of the cache decision engine for one URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheDecision {
    pub should_render: bool,
    pub should_cache: bool,
    pub ttl_seconds: u64,
    pub reason: String,
    pub matched_rule_id: Option<String>,
}

impl CacheDecision {
    /// Identifier reported in diagnostics when no rule matched.
    pub fn rule_label(&self) -> &str {
        self.matched_rule_id.as_deref().unwrap_or("default")
    }

    pub fn is_bypass(&self) -> bool {
        !self.should_render
    }
}
