//! Passthrough contract: forwarding a request to the origin unmodified.

use std::net::IpAddr;

use async_trait::async_trait;
use axum::{
    http::{HeaderMap, Method},
    response::Response,
};
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("origin request timed out")]
    Timeout,
    #[error("origin unreachable: {message}")]
    Connect { message: String },
    #[error("origin request failed: {message}")]
    Request { message: String },
    #[error("request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },
    #[error("invalid origin url `{url}`: {message}")]
    InvalidUrl { url: String, message: String },
}

impl ProxyError {
    pub fn request(message: impl Into<String>) -> Self {
        Self::Request {
            message: message.into(),
        }
    }
}

/// Buffered inbound request, replayable for a second passthrough attempt.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_ip: Option<IpAddr>,
    /// Scheme the client used to reach this proxy.
    pub scheme: &'static str,
}

#[async_trait]
pub trait Upstream: Send + Sync {
    /// Forward `request` to the origin and return its response as received.
    async fn forward(&self, request: &ProxyRequest) -> Result<Response, ProxyError>;
}
