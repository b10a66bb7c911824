//! Cache entries and lookup results.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::keys::CacheKey;

/// Rendered document handed to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedPage {
    pub html: String,
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub html: String,
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
    pub created_at: OffsetDateTime,
    /// From here until `hard_expires_at` the entry is stale.
    pub soft_expires_at: OffsetDateTime,
    pub hard_expires_at: OffsetDateTime,
    pub hit_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale,
    Expired,
}

/// Longest fresh lifetime or stale window an entry may carry (one year).
pub const MAX_TTL_SECONDS: u64 = 365 * 24 * 60 * 60;

impl CacheEntry {
    /// `ttl` is the fresh lifetime; the stale window extends past it. Both
    /// are clamped to [`MAX_TTL_SECONDS`].
    pub fn new(
        key: CacheKey,
        page: CachedPage,
        ttl: Duration,
        stale_window: Duration,
        now: OffsetDateTime,
    ) -> Self {
        let soft_expires_at = add_clamped(now, ttl);
        Self {
            key,
            html: page.html,
            status_code: page.status_code,
            headers: page.headers,
            created_at: now,
            soft_expires_at,
            hard_expires_at: add_clamped(soft_expires_at, stale_window),
            hit_count: 0,
        }
    }

    pub fn freshness(&self, now: OffsetDateTime) -> Freshness {
        if now > self.hard_expires_at {
            Freshness::Expired
        } else if now >= self.soft_expires_at {
            Freshness::Stale
        } else {
            Freshness::Fresh
        }
    }

    /// Time left before hard expiry, zero when already expired.
    pub fn time_to_live(&self, now: OffsetDateTime) -> Duration {
        let remaining = self.hard_expires_at - now;
        if remaining.is_negative() {
            Duration::ZERO
        } else {
            remaining.unsigned_abs()
        }
    }

    pub fn age(&self, now: OffsetDateTime) -> Duration {
        let age = now - self.created_at;
        if age.is_negative() {
            Duration::ZERO
        } else {
            age.unsigned_abs()
        }
    }
}

/// `at + span` with `span` capped at [`MAX_TTL_SECONDS`]. Saturates at `at`
/// when the result would leave the representable date range.
fn add_clamped(at: OffsetDateTime, span: Duration) -> OffsetDateTime {
    let span = span.min(Duration::from_secs(MAX_TTL_SECONDS));
    time::Duration::try_from(span)
        .ok()
        .and_then(|span| at.checked_add(span))
        .unwrap_or(at)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    Fresh(CacheEntry),
    Stale(CacheEntry),
    Miss,
}

impl CacheLookup {
    pub fn classify(entry: CacheEntry, now: OffsetDateTime) -> Self {
        match entry.freshness(now) {
            Freshness::Fresh => CacheLookup::Fresh(entry),
            Freshness::Stale => CacheLookup::Stale(entry),
            Freshness::Expired => CacheLookup::Miss,
        }
    }

    pub fn entry(&self) -> Option<&CacheEntry> {
        match self {
            CacheLookup::Fresh(entry) | CacheLookup::Stale(entry) => Some(entry),
            CacheLookup::Miss => None,
        }
    }
}
