use std::net::{IpAddr, Ipv4Addr};

use httpmock::MockServer;
use rendergate::{
    application::classifier::{IpRanges, Provider},
    config::FeedSettings,
    infra::ip_feeds::HttpIpRangeSource,
};
use url::Url;

const AWS_FEED: &str = r#"{
  "syncToken": "1718000000",
  "createDate": "2024-06-10-06-13-05",
  "prefixes": [
    {"ip_prefix": "10.20.0.0/16", "region": "us-east-1", "service": "EC2"},
    {"ip_prefix": "10.21.0.0/16", "region": "eu-west-1", "service": "EC2"}
  ],
  "ipv6_prefixes": [
    {"ipv6_prefix": "2600:1f14::/35", "region": "us-west-2", "service": "EC2"}
  ]
}"#;

fn ip(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(a, b, c, d))
}

#[tokio::test]
async fn refresh_replaces_fetched_providers_and_keeps_the_rest() {
    let server = MockServer::start_async().await;
    let aws = server
        .mock_async(|when, then| {
            when.method("GET").path("/aws.json");
            then.status(200)
                .header("content-type", "application/json")
                .body(AWS_FEED);
        })
        .await;
    let cloudflare = server
        .mock_async(|when, then| {
            when.method("GET").path("/ips-v4");
            then.status(200).body("192.0.2.0/24\n");
        })
        .await;
    let digitalocean = server
        .mock_async(|when, then| {
            when.method("GET").path("/do.csv");
            then.status(503);
        })
        .await;

    let feed = |path: &str| Some(Url::parse(&server.url(path)).expect("feed url"));
    let source = HttpIpRangeSource::new(FeedSettings {
        aws: feed("/aws.json"),
        gcp: None,
        cloudflare: feed("/ips-v4"),
        digitalocean: feed("/do.csv"),
    })
    .expect("source");

    let ranges = IpRanges::with_static_fallback();
    assert_eq!(ranges.lookup(ip(10, 20, 1, 1)), None);

    let report = ranges.refresh(&source).await;

    aws.assert_async().await;
    cloudflare.assert_async().await;
    digitalocean.assert_async().await;

    assert!(report.updated.contains(&(Provider::Aws, 2)));
    assert!(report.updated.contains(&(Provider::Cloudflare, 1)));
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, Provider::DigitalOcean);
    assert!(report.skipped.contains(&Provider::Gcp));
    assert!(report.skipped.contains(&Provider::Azure));

    assert_eq!(ranges.lookup(ip(10, 20, 1, 1)), Some(Provider::Aws));
    assert_eq!(ranges.lookup(ip(192, 0, 2, 9)), Some(Provider::Cloudflare));
    // Replaced wholesale: the static AWS block is gone.
    assert_eq!(ranges.lookup(ip(3, 1, 2, 3)), None);
    // Failed feed keeps its last-known static table.
    assert_eq!(ranges.lookup(ip(104, 131, 0, 1)), Some(Provider::DigitalOcean));
    // No feed at all: static table.
    assert_eq!(ranges.lookup(ip(35, 184, 0, 1)), Some(Provider::Gcp));
}

#[tokio::test]
async fn feed_without_ipv4_ranges_is_a_failure() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method("GET").path("/ips-v4");
            then.status(200).body("2400:cb00::/32\n");
        })
        .await;

    let source = HttpIpRangeSource::new(FeedSettings {
        aws: None,
        gcp: None,
        cloudflare: Some(Url::parse(&server.url("/ips-v4")).expect("feed url")),
        digitalocean: None,
    })
    .expect("source");

    let ranges = IpRanges::with_static_fallback();
    let report = ranges.refresh(&source).await;

    assert!(report.updated.is_empty());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(ranges.lookup(ip(173, 245, 48, 1)), Some(Provider::Cloudflare));
}
