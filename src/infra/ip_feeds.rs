//! Fetches published provider IP ranges over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use url::Url;

use crate::{
    application::classifier::{FeedError, IpRangeSource, Provider},
    config::FeedSettings,
    domain::cidr::Ipv4Cidr,
    infra::error::InfraError,
};

const FEED_TIMEOUT: Duration = Duration::from_secs(20);

pub struct HttpIpRangeSource {
    client: Client,
    feeds: FeedSettings,
}

impl HttpIpRangeSource {
    pub fn new(feeds: FeedSettings) -> Result<Self, InfraError> {
        let client = Client::builder()
            .timeout(FEED_TIMEOUT)
            .user_agent(concat!("rendergate/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| InfraError::upstream(format!("failed to build feed client: {err}")))?;
        Ok(Self { client, feeds })
    }

    fn feed_url(&self, provider: Provider) -> Option<&Url> {
        match provider {
            Provider::Aws => self.feeds.aws.as_ref(),
            Provider::Gcp => self.feeds.gcp.as_ref(),
            Provider::Cloudflare => self.feeds.cloudflare.as_ref(),
            Provider::DigitalOcean => self.feeds.digitalocean.as_ref(),
            Provider::Azure => None,
        }
    }

    async fn download(&self, provider: Provider, url: &Url) -> Result<String, FeedError> {
        let http_error = |err: reqwest::Error| FeedError::Http {
            provider: provider.as_str(),
            message: err.to_string(),
        };
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(http_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::Http {
                provider: provider.as_str(),
                message: format!("unexpected status {status}"),
            });
        }
        response.text().await.map_err(http_error)
    }
}

#[async_trait]
impl IpRangeSource for HttpIpRangeSource {
    async fn fetch(&self, provider: Provider) -> Result<Option<Vec<Ipv4Cidr>>, FeedError> {
        let Some(url) = self.feed_url(provider) else {
            return Ok(None);
        };
        let body = self.download(provider, url).await?;
        let blocks = parse_feed(provider, &body)?;
        if blocks.is_empty() {
            return Err(FeedError::Empty {
                provider: provider.as_str(),
            });
        }
        Ok(Some(blocks))
    }
}

#[derive(Debug, Deserialize)]
struct AwsFeed {
    prefixes: Vec<AwsPrefix>,
}

#[derive(Debug, Deserialize)]
struct AwsPrefix {
    ip_prefix: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GcpFeed {
    prefixes: Vec<GcpPrefix>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GcpPrefix {
    ipv4_prefix: Option<String>,
}

/// Extracts IPv4 blocks from a provider's feed body. IPv6 entries and
/// unparseable lines are ignored.
pub fn parse_feed(provider: Provider, body: &str) -> Result<Vec<Ipv4Cidr>, FeedError> {
    let parse_error = |err: serde_json::Error| FeedError::Parse {
        provider: provider.as_str(),
        message: err.to_string(),
    };

    let candidates: Vec<String> = match provider {
        Provider::Aws => serde_json::from_str::<AwsFeed>(body)
            .map_err(parse_error)?
            .prefixes
            .into_iter()
            .filter_map(|prefix| prefix.ip_prefix)
            .collect(),
        Provider::Gcp => serde_json::from_str::<GcpFeed>(body)
            .map_err(parse_error)?
            .prefixes
            .into_iter()
            .filter_map(|prefix| prefix.ipv4_prefix)
            .collect(),
        Provider::Cloudflare => body.lines().map(str::to_string).collect(),
        Provider::DigitalOcean => body
            .lines()
            .filter_map(|line| line.split(',').next())
            .map(str::to_string)
            .collect(),
        Provider::Azure => Vec::new(),
    };

    Ok(candidates
        .iter()
        .map(|candidate| candidate.trim())
        .filter(|candidate| !candidate.is_empty() && !candidate.contains(':'))
        .filter_map(|candidate| candidate.parse::<Ipv4Cidr>().ok())
        .collect())
}
