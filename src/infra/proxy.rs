//! Origin passthrough over `reqwest`.

use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, header},
    response::Response,
};
use reqwest::{Client, redirect};
use tracing::debug;
use url::Url;

use crate::{
    application::orchestrator::{ProxyError, ProxyRequest, Upstream},
    infra::error::InfraError,
};

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

static HOP_BY_HOP: [HeaderName; 9] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    HeaderName::from_static("proxy-connection"),
];

pub struct OriginProxy {
    client: Client,
    origin: Url,
}

impl OriginProxy {
    pub fn new(origin: Url, timeout: Duration) -> Result<Self, InfraError> {
        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .timeout(timeout)
            .build()
            .map_err(|err| InfraError::upstream(format!("failed to build origin client: {err}")))?;
        Ok(Self { client, origin })
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    fn target(&self, path_and_query: &str) -> Url {
        let (path, query) = match path_and_query.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (path_and_query, None),
        };
        let mut url = self.origin.clone();
        url.set_path(path);
        url.set_query(query);
        url
    }
}

#[async_trait]
impl Upstream for OriginProxy {
    async fn forward(&self, request: &ProxyRequest) -> Result<Response, ProxyError> {
        let url = self.target(&request.path_and_query);
        let headers = outbound_headers(request);

        debug!(
            target = "rendergate::infra::proxy",
            method = %request.method,
            url = %url,
            "Forwarding to origin"
        );

        let upstream = self
            .client
            .request(request.method.clone(), url)
            .headers(headers)
            .body(request.body.clone())
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = upstream.status();
        let mut headers = upstream.headers().clone();
        strip_hop_by_hop(&mut headers);
        let body = upstream.bytes().await.map_err(map_reqwest_error)?;

        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

fn outbound_headers(request: &ProxyRequest) -> HeaderMap {
    let mut headers = request.headers.clone();
    strip_hop_by_hop(&mut headers);
    let inbound_host = headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);

    if let Some(ip) = request.client_ip {
        let forwarded = match headers
            .get(&X_FORWARDED_FOR)
            .and_then(|value| value.to_str().ok())
        {
            Some(existing) if !existing.trim().is_empty() => format!("{existing}, {ip}"),
            _ => ip.to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }
    headers.insert(
        X_FORWARDED_PROTO,
        HeaderValue::from_static(request.scheme),
    );
    if let Some(host) = inbound_host {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers
}

/// Removes the fixed hop-by-hop set and any header named by `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::try_from(name.trim()).ok())
        .collect();
    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

fn map_reqwest_error(err: reqwest::Error) -> ProxyError {
    if err.is_timeout() {
        ProxyError::Timeout
    } else if err.is_connect() {
        ProxyError::Connect {
            message: err.to_string(),
        }
    } else {
        ProxyError::request(err.to_string())
    }
}
