//! Infrastructure adapters and runtime bootstrap.

pub mod browser;
pub mod error;
pub mod events;
pub mod http;
pub mod ip_feeds;
pub mod proxy;
pub mod telemetry;
