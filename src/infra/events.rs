//! Traffic event forwarder: drains the outcome queue in batches.

use std::time::Duration;

use metrics::counter;
use reqwest::Client;
use tokio::{sync::mpsc, time::MissedTickBehavior};
use tracing::{debug, warn};
use url::Url;

use crate::{
    application::orchestrator::OutcomeRecord, config::EventsSettings, infra::error::InfraError,
};

const METRIC_EVENTS_FORWARDED: &str = "prerender_events_forwarded_total";
const SINK_TIMEOUT: Duration = Duration::from_secs(10);

pub struct EventForwarder {
    client: Client,
    endpoint: Option<Url>,
    batch_size: usize,
    flush_interval: Duration,
}

impl EventForwarder {
    pub fn new(settings: &EventsSettings) -> Result<Self, InfraError> {
        let client = Client::builder()
            .timeout(SINK_TIMEOUT)
            .build()
            .map_err(|err| InfraError::upstream(format!("failed to build event client: {err}")))?;
        Ok(Self {
            client,
            endpoint: settings.endpoint.clone(),
            batch_size: settings.batch_size.get(),
            flush_interval: settings.flush_interval,
        })
    }

    /// Runs until every sender is dropped, then flushes what is left.
    pub async fn run(self, mut receiver: mpsc::Receiver<OutcomeRecord>) {
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut batch = Vec::with_capacity(self.batch_size);

        loop {
            tokio::select! {
                received = receiver.recv() => match received {
                    Some(record) => {
                        batch.push(record);
                        if batch.len() >= self.batch_size {
                            self.flush(&mut batch).await;
                        }
                    }
                    None => {
                        self.flush(&mut batch).await;
                        break;
                    }
                },
                _ = ticker.tick() => self.flush(&mut batch).await,
            }
        }
    }

    async fn flush(&self, batch: &mut Vec<OutcomeRecord>) {
        if batch.is_empty() {
            return;
        }
        let records = std::mem::take(batch);
        let count = records.len();

        let Some(endpoint) = self.endpoint.as_ref() else {
            for record in &records {
                debug!(
                    target = "rendergate::infra::events",
                    path = %record.path,
                    action = record.action.as_str(),
                    cache_status = record.cache_status.as_str(),
                    status = record.status,
                    "Traffic event"
                );
            }
            return;
        };

        let result = self
            .client
            .post(endpoint.clone())
            .json(&records)
            .send()
            .await
            .and_then(|response| response.error_for_status());

        match result {
            Ok(_) => {
                counter!(METRIC_EVENTS_FORWARDED).increment(count as u64);
            }
            Err(err) => {
                warn!(
                    target = "rendergate::infra::events",
                    op = "flush",
                    result = "error",
                    dropped = count,
                    error = %err,
                    "Failed to deliver traffic events"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use httpmock::MockServer;

    use super::*;
    use crate::{
        application::orchestrator::EventSink,
        domain::types::{CacheStatus, OutcomeAction},
    };

    fn record(path: &str) -> OutcomeRecord {
        OutcomeRecord {
            timestamp: OutcomeRecord::timestamp_now(),
            method: "GET".to_string(),
            path: path.to_string(),
            ip: None,
            user_agent: Some("Bingbot".to_string()),
            is_bot: true,
            action: OutcomeAction::Render,
            cache_status: CacheStatus::Fresh,
            matched_rule: Some("default".to_string()),
            status: 200,
            response_time_ms: 3,
        }
    }

    fn settings(endpoint: Option<Url>) -> EventsSettings {
        EventsSettings {
            capacity: NonZeroUsize::new(16).expect("non-zero"),
            endpoint,
            batch_size: NonZeroUsize::new(2).expect("non-zero"),
            flush_interval: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn posts_full_batches_and_the_remainder() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method("POST")
                    .path("/events")
                    .header("content-type", "application/json");
                then.status(204);
            })
            .await;

        let endpoint = Url::parse(&server.url("/events")).expect("endpoint");
        let forwarder = EventForwarder::new(&settings(Some(endpoint))).expect("forwarder");
        let (sink, receiver) = EventSink::channel(16);
        for path in ["/a", "/b", "/c"] {
            sink.record(record(path), Duration::from_millis(3));
        }
        drop(sink);

        forwarder.run(receiver).await;
        mock.assert_calls_async(2).await;
    }

    #[tokio::test]
    async fn without_endpoint_records_are_only_logged() {
        let forwarder = EventForwarder::new(&settings(None)).expect("forwarder");
        let (sink, receiver) = EventSink::channel(4);
        sink.record(record("/a"), Duration::ZERO);
        drop(sink);

        forwarder.run(receiver).await;
    }
}
