//! Render task lifecycle types.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use url::Url;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
        }
    }
}

/// Foreground renders serve a waiting request; background renders refresh
/// stale entries and yield capacity to foreground work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderPriority {
    Foreground,
    Background,
}

impl RenderPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            RenderPriority::Foreground => "foreground",
            RenderPriority::Background => "background",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderTask {
    pub id: Uuid,
    pub url: Url,
    pub priority: RenderPriority,
    /// Attempts made so far; never exceeds `max_retries + 1`.
    pub attempt: u32,
    pub max_retries: u32,
    pub deadline: Instant,
    pub state: TaskState,
}

impl RenderTask {
    pub fn new(url: Url, priority: RenderPriority, max_retries: u32, budget: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            url,
            priority,
            attempt: 0,
            max_retries,
            deadline: Instant::now() + budget,
            state: TaskState::Pending,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn has_retries_left(&self) -> bool {
        self.attempt <= self.max_retries
    }
}

/// Which completion signal ended the wait for a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WaitTier {
    NetworkIdle,
    NetworkQuiet,
    DomReady,
}

impl WaitTier {
    pub fn as_str(self) -> &'static str {
        match self {
            WaitTier::NetworkIdle => "network-idle",
            WaitTier::NetworkQuiet => "network-quiet",
            WaitTier::DomReady => "dom-ready",
        }
    }
}

/// Blocked-versus-allowed sub-request counts for one render.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterceptStats {
    pub allowed: u64,
    pub blocked: u64,
}

#[derive(Debug, Clone)]
pub struct RenderResult {
    pub task_id: Uuid,
    pub url: Url,
    pub html: String,
    pub status_code: u16,
    pub attempts: u32,
    pub wait_tier: WaitTier,
    pub elapsed: Duration,
    pub intercepted: InterceptStats,
}
