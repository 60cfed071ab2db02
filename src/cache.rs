use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::clock::{Clock, SystemClock};

/// Abstract key-value store holding serialized retry-after deadlines.
///
/// The gate treats the store as opaque: no transactional guarantees are required,
/// and entries are expected to disappear on their own once their TTL elapses.
#[async_trait]
pub trait RetryAfterCache: Send + Sync {
    /// Error type for storage operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Fetch the serialized deadline stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<String>, Self::Error>;

    /// Store `value` under `key`, overwriting any previous entry.
    ///
    /// * `ttl`: how long the store should keep the entry before evicting it.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), Self::Error>;
}

#[async_trait]
impl<C> RetryAfterCache for Arc<C>
where
    C: RetryAfterCache + ?Sized,
{
    type Error = C::Error;

    async fn get(&self, key: &str) -> Result<Option<String>, Self::Error> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), Self::Error> {
        (**self).set(key, value, ttl).await
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    // `None` when the TTL does not fit in a timestamp.
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Simple in-memory store with TTL eviction.
///
/// An expired entry is dropped when its key is read, and every write sweeps all expired
/// entries, so keys that are never read again do not accumulate. Clones share the same map.
#[derive(Clone, Debug)]
pub struct InMemoryCache {
    data: Arc<Mutex<HashMap<String, Entry>>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self { data: Arc::default(), clock: Arc::new(SystemClock) }
    }
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate expiry against `clock` instead of the system clock.
    pub fn with_clock<K: Clock + 'static>(mut self, clock: K) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// When the entry for `key` will be evicted, if it is present and bounded.
    pub fn expires_at(&self, key: &str) -> Option<DateTime<Utc>> {
        let guard = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        guard.get(key).and_then(|entry| entry.expires_at)
    }

    /// Number of stored entries, expired ones included until the next read of their key
    /// or the next write.
    pub fn len(&self) -> usize {
        self.data.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RetryAfterCache for InMemoryCache {
    type Error = std::convert::Infallible;

    async fn get(&self, key: &str) -> Result<Option<String>, Self::Error> {
        let now = self.clock.now();
        let mut guard = self.data.lock().unwrap_or_else(PoisonError::into_inner);

        let expired = match guard.get(key) {
            None => return Ok(None),
            Some(entry) => entry.is_expired(now),
        };
        if expired {
            guard.remove(key);
            return Ok(None);
        }
        Ok(guard.get(key).map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), Self::Error> {
        let now = self.clock.now();
        let expires_at = TimeDelta::from_std(ttl).ok().and_then(|ttl| now.checked_add_signed(ttl));

        let mut guard = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        guard.retain(|_, entry| !entry.is_expired(now));
        guard.insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }
}
