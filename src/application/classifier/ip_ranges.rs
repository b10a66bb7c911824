//! Published cloud-provider and CDN address ranges.
//!
//! The table in use is an immutable snapshot behind an `Arc`; a refresh builds
//! a replacement off the request path and swaps it in with a single write.

use std::{
    collections::BTreeMap,
    net::IpAddr,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use futures::future::join_all;
use metrics::counter;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    cache::lock::{rw_read, rw_write},
    domain::cidr::Ipv4Cidr,
};

const SOURCE: &str = "application::classifier::ip_ranges";
const METRIC_IP_REFRESH: &str = "prerender_ip_refresh_total";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Aws,
    Gcp,
    Azure,
    DigitalOcean,
    Cloudflare,
}

impl Provider {
    pub const ALL: [Provider; 5] = [
        Provider::Aws,
        Provider::Gcp,
        Provider::Azure,
        Provider::DigitalOcean,
        Provider::Cloudflare,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Aws => "aws",
            Provider::Gcp => "gcp",
            Provider::Azure => "azure",
            Provider::DigitalOcean => "digitalocean",
            Provider::Cloudflare => "cloudflare",
        }
    }

    /// Ranges used until the first successful refresh, and for providers
    /// without a published feed.
    pub fn static_ranges(self) -> &'static [&'static str] {
        match self {
            Provider::Aws => &[
                "3.0.0.0/9",
                "13.32.0.0/15",
                "18.128.0.0/9",
                "34.192.0.0/10",
                "52.0.0.0/11",
                "54.64.0.0/11",
            ],
            Provider::Gcp => &[
                "34.64.0.0/10",
                "35.184.0.0/13",
                "35.192.0.0/12",
                "104.196.0.0/14",
                "130.211.0.0/16",
            ],
            Provider::Azure => &[
                "13.64.0.0/11",
                "20.36.0.0/14",
                "40.64.0.0/10",
                "52.224.0.0/11",
                "104.40.0.0/13",
            ],
            Provider::DigitalOcean => &[
                "104.131.0.0/16",
                "138.68.0.0/16",
                "159.65.0.0/16",
                "167.99.0.0/16",
                "178.62.0.0/16",
                "188.166.0.0/16",
            ],
            Provider::Cloudflare => &[
                "173.245.48.0/20",
                "103.21.244.0/22",
                "103.22.200.0/22",
                "103.31.4.0/22",
                "141.101.64.0/18",
                "108.162.192.0/18",
                "190.93.240.0/20",
                "188.114.96.0/20",
                "197.234.240.0/22",
                "198.41.128.0/17",
                "162.158.0.0/15",
                "104.16.0.0/13",
                "104.24.0.0/14",
                "172.64.0.0/13",
                "131.0.72.0/22",
            ],
        }
    }
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed request for {provider} failed: {message}")]
    Http {
        provider: &'static str,
        message: String,
    },
    #[error("feed for {provider} could not be parsed: {message}")]
    Parse {
        provider: &'static str,
        message: String,
    },
    #[error("feed for {provider} contained no IPv4 ranges")]
    Empty { provider: &'static str },
}

/// Fetches the current published ranges of one provider.
#[async_trait]
pub trait IpRangeSource: Send + Sync {
    /// `Ok(None)` when the provider has no feed configured.
    async fn fetch(&self, provider: Provider) -> Result<Option<Vec<Ipv4Cidr>>, FeedError>;
}

#[derive(Debug, Clone, Default)]
pub struct IpRangeTable {
    ranges: BTreeMap<Provider, Vec<Ipv4Cidr>>,
}

impl IpRangeTable {
    pub fn static_fallback() -> Self {
        let mut ranges = BTreeMap::new();
        for provider in Provider::ALL {
            let blocks = provider
                .static_ranges()
                .iter()
                .filter_map(|block| block.parse::<Ipv4Cidr>().ok())
                .collect();
            ranges.insert(provider, blocks);
        }
        Self { ranges }
    }

    pub fn with_provider(mut self, provider: Provider, blocks: Vec<Ipv4Cidr>) -> Self {
        self.ranges.insert(provider, blocks);
        self
    }

    /// Provider whose published ranges contain `ip`.
    pub fn lookup(&self, ip: IpAddr) -> Option<Provider> {
        self.ranges
            .iter()
            .find(|(_, blocks)| blocks.iter().any(|block| block.contains_ip(ip)))
            .map(|(provider, _)| *provider)
    }

    pub fn provider_len(&self, provider: Provider) -> usize {
        self.ranges.get(&provider).map_or(0, Vec::len)
    }

    pub fn len(&self) -> usize {
        self.ranges.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of one refresh round, per provider.
#[derive(Debug, Default, Clone)]
pub struct RefreshReport {
    pub updated: Vec<(Provider, usize)>,
    pub failed: Vec<(Provider, String)>,
    pub skipped: Vec<Provider>,
}

pub struct IpRanges {
    table: RwLock<Arc<IpRangeTable>>,
}

impl IpRanges {
    pub fn new(table: IpRangeTable) -> Self {
        Self {
            table: RwLock::new(Arc::new(table)),
        }
    }

    pub fn with_static_fallback() -> Self {
        Self::new(IpRangeTable::static_fallback())
    }

    pub fn snapshot(&self) -> Arc<IpRangeTable> {
        Arc::clone(&rw_read(&self.table, SOURCE, "snapshot"))
    }

    pub fn lookup(&self, ip: IpAddr) -> Option<Provider> {
        self.snapshot().lookup(ip)
    }

    /// Refresh every provider independently. A provider whose fetch fails
    /// keeps its last-known ranges.
    pub async fn refresh(&self, source: &dyn IpRangeSource) -> RefreshReport {
        let fetched = join_all(Provider::ALL.into_iter().map(|provider| async move {
            (provider, source.fetch(provider).await)
        }))
        .await;

        let mut report = RefreshReport::default();
        let mut next = (*self.snapshot()).clone();

        for (provider, result) in fetched {
            match result {
                Ok(Some(blocks)) if !blocks.is_empty() => {
                    report.updated.push((provider, blocks.len()));
                    counter!(METRIC_IP_REFRESH, "provider" => provider.as_str(), "result" => "updated")
                        .increment(1);
                    next = next.with_provider(provider, blocks);
                }
                Ok(Some(_)) => {
                    let err = FeedError::Empty {
                        provider: provider.as_str(),
                    };
                    self.record_failure(provider, &err, &mut report);
                }
                Ok(None) => report.skipped.push(provider),
                Err(err) => self.record_failure(provider, &err, &mut report),
            }
        }

        if !report.updated.is_empty() {
            *rw_write(&self.table, SOURCE, "refresh") = Arc::new(next);
        }

        info!(
            target = "rendergate::classifier::ip_ranges",
            op = "refresh",
            updated = report.updated.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "IP range refresh finished"
        );
        report
    }

    fn record_failure(&self, provider: Provider, err: &FeedError, report: &mut RefreshReport) {
        warn!(
            target = "rendergate::classifier::ip_ranges",
            op = "refresh",
            provider = provider.as_str(),
            result = "kept_last_known",
            error = %err,
            "IP range feed failed"
        );
        counter!(METRIC_IP_REFRESH, "provider" => provider.as_str(), "result" => "failed")
            .increment(1);
        report.failed.push((provider, err.to_string()));
    }
}

impl Default for IpRanges {
    fn default() -> Self {
        Self::with_static_fallback()
    }
}
