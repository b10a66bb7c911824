//! Rendered page cache.
//!
//! One facade ([`CacheStore`]) over two interchangeable backends:
//!
//! - **memory**: bounded in-process store, insertion-order eviction
//! - **redis**: networked key/value backend for multi-instance deployments
//!
//! Entries carry a soft expiry (end of freshness) and a hard expiry (end of
//! the stale-while-revalidate window). Lookups report `Fresh`, `Stale` and
//! `Miss` distinctly; nothing is returned past hard expiry.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! max_entries = 1000
//! ttl_seconds = 86400
//! stale_window_seconds = 3600
//! redis_url = "redis://127.0.0.1:6379"
//! # ... see config.rs for all options
//! ```

mod config;
mod entry;
mod error;
mod keys;
pub(crate) mod lock;
mod memory;
mod redis;
mod store;

pub use config::CacheConfig;
pub use entry::{CacheEntry, CacheLookup, CachedPage, Freshness, MAX_TTL_SECONDS};
pub use error::CacheError;
pub use keys::{CacheKey, glob_match};
pub use store::{CacheStats, CacheStore};
