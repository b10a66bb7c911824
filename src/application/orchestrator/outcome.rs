//! Per-request outcome records.
//!
//! Every terminal transition of the orchestrator produces one record. It is
//! logged, counted, and queued for the external traffic sink with `try_send`;
//! a full queue drops the record. None of this influences routing.

use std::time::Duration;

use metrics::{counter, histogram};
use serde::Serialize;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tokio::sync::mpsc;
use tracing::info;

use crate::domain::types::{CacheStatus, OutcomeAction};

const METRIC_REQUESTS: &str = "prerender_requests_total";
const METRIC_REQUEST_SECONDS: &str = "prerender_request_duration_seconds";
const METRIC_EVENTS_DROPPED: &str = "prerender_events_dropped_total";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeRecord {
    /// RFC 3339 time the request finished.
    pub timestamp: String,
    pub method: String,
    pub path: String,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub is_bot: bool,
    pub action: OutcomeAction,
    pub cache_status: CacheStatus,
    pub matched_rule: Option<String>,
    pub status: u16,
    pub response_time_ms: u64,
}

impl OutcomeRecord {
    pub fn timestamp_now() -> String {
        OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default()
    }
}

/// Producer side of the traffic event queue.
#[derive(Clone)]
pub struct EventSink {
    sender: Option<mpsc::Sender<OutcomeRecord>>,
}

impl EventSink {
    /// Bounded queue of `capacity` records and its consumer end.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<OutcomeRecord>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                sender: Some(sender),
            },
            receiver,
        )
    }

    /// Sink that only logs and counts.
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    pub fn record(&self, record: OutcomeRecord, elapsed: Duration) {
        counter!(
            METRIC_REQUESTS,
            "action" => record.action.as_str(),
            "cache_status" => record.cache_status.as_str()
        )
        .increment(1);
        histogram!(METRIC_REQUEST_SECONDS, "action" => record.action.as_str())
            .record(elapsed.as_secs_f64());

        info!(
            target = "rendergate::orchestrator",
            method = %record.method,
            path = %record.path,
            is_bot = record.is_bot,
            action = record.action.as_str(),
            cache_status = record.cache_status.as_str(),
            matched_rule = record.matched_rule.as_deref().unwrap_or("-"),
            status = record.status,
            elapsed_ms = record.response_time_ms,
            "Request handled"
        );

        let Some(sender) = &self.sender else {
            return;
        };
        if sender.try_send(record).is_err() {
            counter!(METRIC_EVENTS_DROPPED).increment(1);
        }
    }
}
