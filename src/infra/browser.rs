//! Remote browser engine speaking the browserless-compatible `/content` API.
//!
//! The service is stateless over HTTP, so a session only remembers the page
//! it was asked to load. Navigation happens when the pool waits on a
//! completion signal: each wait tier becomes one `/content` call with the
//! matching `waitUntil` strategy.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use tracing::debug;
use url::Url;

use crate::{
    application::{
        interceptor::ResourceInterceptor,
        render::{BrowserEngine, BrowserSession, NetworkEvent, PageContent, RenderError, WaitCondition},
    },
    domain::types::ResourceType,
    infra::error::InfraError,
};

const CONTENT_PATH: &str = "content";
const RESPONSE_CODE_HEADER: &str = "x-response-code";
/// Headroom on top of the in-browser timeout for the HTTP exchange itself.
const TRANSPORT_SLACK: Duration = Duration::from_secs(2);

pub struct RemoteBrowserEngine {
    client: Client,
    endpoint: Url,
}

impl RemoteBrowserEngine {
    pub fn new(base: &Url, token: Option<&str>) -> Result<Self, InfraError> {
        let mut endpoint = base.clone();
        if !endpoint.path().ends_with('/') {
            let path = format!("{}/", endpoint.path());
            endpoint.set_path(&path);
        }
        let mut endpoint = endpoint.join(CONTENT_PATH).map_err(|err| {
            InfraError::configuration(format!("invalid render engine url `{base}`: {err}"))
        })?;
        if let Some(token) = token {
            endpoint.query_pairs_mut().append_pair("token", token);
        }

        let client = Client::builder()
            .build()
            .map_err(|err| InfraError::upstream(format!("failed to build engine client: {err}")))?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl BrowserEngine for RemoteBrowserEngine {
    async fn open_session(&self) -> Result<Box<dyn BrowserSession>, RenderError> {
        Ok(Box::new(RemoteSession {
            client: self.client.clone(),
            endpoint: self.endpoint.clone(),
            target: None,
            page: None,
        }))
    }
}

struct Target {
    url: Url,
    interceptor: Arc<ResourceInterceptor>,
}

struct RemoteSession {
    client: Client,
    endpoint: Url,
    target: Option<Target>,
    page: Option<PageContent>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ContentRequest<'a> {
    url: &'a str,
    goto_options: GotoOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    reject_request_pattern: Option<Vec<String>>,
    reject_resource_types: Vec<ResourceType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    wait_for_timeout: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GotoOptions {
    wait_until: &'static str,
    timeout: u64,
}

fn wait_until(condition: WaitCondition) -> (&'static str, Option<Duration>) {
    match condition {
        WaitCondition::NetworkIdle { .. } => ("networkidle0", None),
        WaitCondition::NetworkQuiet { .. } => ("networkidle2", None),
        WaitCondition::DomReady { grace } => ("domcontentloaded", Some(grace)),
    }
}

#[async_trait]
impl BrowserSession for RemoteSession {
    async fn navigate(
        &mut self,
        url: &Url,
        interceptor: Arc<ResourceInterceptor>,
    ) -> Result<(), RenderError> {
        self.page = None;
        self.target = Some(Target {
            url: url.clone(),
            interceptor,
        });
        Ok(())
    }

    async fn wait_for(
        &mut self,
        condition: WaitCondition,
        timeout: Duration,
    ) -> Result<(), RenderError> {
        let Some(target) = self.target.as_ref() else {
            return Err(RenderError::unknown("wait requested before navigation"));
        };

        let (strategy, grace) = wait_until(condition);
        let pattern = target.interceptor.reject_pattern();
        let body = ContentRequest {
            url: target.url.as_str(),
            goto_options: GotoOptions {
                wait_until: strategy,
                timeout: timeout.as_millis() as u64,
            },
            reject_request_pattern: (!pattern.is_empty()).then(|| vec![pattern]),
            reject_resource_types: target.interceptor.rejected_resource_types(),
            wait_for_timeout: grace.map(|grace| grace.as_millis() as u64),
        };

        let started = std::time::Instant::now();
        let response = self
            .client
            .post(self.endpoint.clone())
            .timeout(timeout + grace.unwrap_or_default() + TRANSPORT_SLACK)
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        let page_status = response
            .headers()
            .get(RESPONSE_CODE_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u16>().ok());
        let text = response.text().await.map_err(map_transport_error)?;

        if !status.is_success() {
            return Err(map_status_error(status, &text));
        }

        debug!(
            target = "rendergate::infra::browser",
            url = %target.url,
            strategy,
            page_status = page_status.unwrap_or(200),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Page content received"
        );

        self.page = Some(PageContent {
            html: text,
            status: page_status.unwrap_or(200),
        });
        Ok(())
    }

    async fn content(&mut self) -> Result<PageContent, RenderError> {
        self.page
            .take()
            .ok_or_else(|| RenderError::unknown("no page content available"))
    }

    /// The content API does not report sub-requests.
    fn network_events(&self) -> Vec<NetworkEvent> {
        Vec::new()
    }

    async fn close(self: Box<Self>) {}
}

fn map_transport_error(err: reqwest::Error) -> RenderError {
    if err.is_timeout() {
        RenderError::timeout("engine request")
    } else if err.is_connect() {
        RenderError::crash(format!("render engine unreachable: {err}"))
    } else {
        RenderError::network(err.to_string())
    }
}

fn map_status_error(status: StatusCode, body: &str) -> RenderError {
    let detail = body.trim();
    let detail = if detail.len() > 512 {
        let mut end = 512;
        while !detail.is_char_boundary(end) {
            end -= 1;
        }
        &detail[..end]
    } else {
        detail
    };
    let lowered = detail.to_ascii_lowercase();

    if status == StatusCode::REQUEST_TIMEOUT || lowered.contains("timeout") {
        return RenderError::timeout("navigation");
    }
    if lowered.contains("evaluation failed") || lowered.contains("pageerror") {
        return RenderError::javascript(detail);
    }
    if status.is_server_error() {
        return RenderError::network(format!("engine returned {status}: {detail}"));
    }
    if lowered.contains("net::err") {
        return RenderError::network(detail);
    }
    RenderError::unknown(format!("engine returned {status}: {detail}"))
}
