//! Single-flight table: at most one render per cache key at any instant.
//!
//! The first caller for a key becomes the leader and owns the table entry
//! until its [`FlightLeader`] is dropped. Later callers receive a follower
//! handle that resolves to the leader's outcome. Dropping the leader without
//! completing (a panic, an aborted task) wakes followers with
//! [`FlightAbandoned`] instead of leaving them waiting.

use std::sync::Arc;

use dashmap::{DashMap, mapref::entry::Entry};
use thiserror::Error;
use tokio::sync::watch;

use crate::cache::CacheKey;

type Slot<T> = watch::Receiver<Option<Arc<T>>>;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("render flight ended without an outcome")]
pub struct FlightAbandoned;

pub struct RenderFlights<T> {
    inner: Arc<DashMap<CacheKey, Slot<T>>>,
}

impl<T> Clone for RenderFlights<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for RenderFlights<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
        }
    }
}

pub enum Flight<T> {
    Leader(FlightLeader<T>),
    Follower(FlightFollower<T>),
}

impl<T> RenderFlights<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the flight for `key`, leading it when none is in progress.
    pub fn join(&self, key: &CacheKey) -> Flight<T> {
        match self.inner.entry(key.clone()) {
            Entry::Occupied(occupied) => Flight::Follower(FlightFollower {
                receiver: occupied.get().clone(),
            }),
            Entry::Vacant(vacant) => {
                let (sender, receiver) = watch::channel(None);
                vacant.insert(receiver);
                Flight::Leader(FlightLeader {
                    key: key.clone(),
                    sender,
                    flights: Arc::clone(&self.inner),
                })
            }
        }
    }

    pub fn in_flight(&self, key: &CacheKey) -> bool {
        self.inner.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

pub struct FlightLeader<T> {
    key: CacheKey,
    sender: watch::Sender<Option<Arc<T>>>,
    flights: Arc<DashMap<CacheKey, Slot<T>>>,
}

impl<T> FlightLeader<T> {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Publish the outcome to every follower and release the key.
    pub fn complete(self, outcome: Arc<T>) {
        self.sender.send_replace(Some(outcome));
    }
}

impl<T> Drop for FlightLeader<T> {
    fn drop(&mut self) {
        self.flights.remove(&self.key);
    }
}

pub struct FlightFollower<T> {
    receiver: Slot<T>,
}

impl<T> FlightFollower<T> {
    pub async fn outcome(mut self) -> Result<Arc<T>, FlightAbandoned> {
        let published = self
            .receiver
            .wait_for(Option::is_some)
            .await
            .map_err(|_| FlightAbandoned)?;
        published.as_ref().map(Arc::clone).ok_or(FlightAbandoned)
    }
}
