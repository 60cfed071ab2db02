//! The retry-after gate: deadline bookkeeping independent of tower.
//!
//! A key is BLOCKED while its cached deadline is at or after "now" and UNBLOCKED
//! otherwise. Only an observed `Retry-After` moves a key into BLOCKED; it leaves
//! BLOCKED purely by the passage of time.
//!
//! Checks and updates are not coordinated across concurrent requests: two requests
//! may both pass [`RetryAfterGate::check`] before either records a deadline, and the
//! last [`RetryAfterGate::record`] wins.

use chrono::{DateTime, Utc};
use http::header::{HeaderMap, HeaderName};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{debug, info};

use crate::cache::RetryAfterCache;
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, MissingKeyPolicy, RetryAfterConfig};
use crate::error::{CacheError, CacheOp, InvalidCacheKey, RateLimited, RetryAfterError};
use crate::header::{self, HeaderParseError, Observation, RetryAfter};
use crate::options::{KeyKind, RequestOptions, REQUEST_OPTION};

/// Result type of gate operations, which never involve an inner service.
pub type GateResult<T> = Result<T, RetryAfterError<Infallible>>;

/// Retry-after bookkeeping over a [`RetryAfterCache`].
///
/// Clones share the same cache and clock via `Arc`.
pub struct RetryAfterGate<C> {
    cache: Arc<C>,
    clock: Arc<dyn Clock>,
    config: RetryAfterConfig,
    header: HeaderName,
}

impl<C> Clone for RetryAfterGate<C> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            clock: self.clock.clone(),
            config: self.config.clone(),
            header: self.header.clone(),
        }
    }
}

impl<C> std::fmt::Debug for RetryAfterGate<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryAfterGate")
            .field("clock", &self.clock)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<C> RetryAfterGate<C>
where
    C: RetryAfterCache + 'static,
{
    /// Gate with the default configuration: per-request keys required, 1s TTL margin.
    pub fn new(cache: C) -> Self {
        Self {
            cache: Arc::new(cache),
            clock: Arc::new(SystemClock),
            config: RetryAfterConfig::default(),
            header: http::header::RETRY_AFTER,
        }
    }

    /// Gate with an explicit config, validating it.
    pub fn with_config(cache: C, config: RetryAfterConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let header = config.header_name()?;
        Ok(Self { cache: Arc::new(cache), clock: Arc::new(SystemClock), config, header })
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<K: Clock + 'static>(mut self, clock: K) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn config(&self) -> &RetryAfterConfig {
        &self.config
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    /// Pick the bucket for a request.
    ///
    /// A per-request option wins over the default key. `Ok(None)` means the request
    /// should be forwarded ungated.
    pub fn resolve_key(
        &self,
        options: Option<&RequestOptions>,
    ) -> Result<Option<String>, InvalidCacheKey> {
        if let Some(value) = options.and_then(|o| o.get(REQUEST_OPTION)) {
            return match KeyKind::of(value) {
                Some(kind) => Err(InvalidCacheKey::new(kind)),
                None => Ok(value.as_str().map(str::to_owned)),
            };
        }
        match (self.config.default_key(), self.config.missing_key_policy()) {
            (Some(key), _) => Ok(Some(key.to_owned())),
            (None, MissingKeyPolicy::PassThrough) => Ok(None),
            (None, MissingKeyPolicy::Reject) => Err(InvalidCacheKey::new(KeyKind::Missing)),
        }
    }

    /// Fail with [`RateLimited`] if `key` has a deadline at or after now.
    ///
    /// Past deadlines are ignored but left in the cache.
    pub async fn check(&self, key: &str) -> GateResult<()> {
        let cached =
            self.cache.get(key).await.map_err(|e| CacheError::new(CacheOp::Get, key, e))?;
        let Some(raw) = cached else {
            return Ok(());
        };
        let Some(until) = header::parse_timestamp(&raw) else {
            return Err(RetryAfterError::InvalidCacheEntry { key: key.to_owned(), value: raw });
        };

        let now = self.clock.now();
        if until >= now {
            info!(
                key,
                until = %header::format_timestamp(until),
                checked_at = %header::format_timestamp(now),
                "retry-after window active, short-circuiting"
            );
            return Err(RateLimited::new(key, until, now).into());
        }
        debug!(key, until = %header::format_timestamp(until), "retry-after deadline passed");
        Ok(())
    }

    /// Read the rate-limit signal from `headers`, resolving it against now.
    ///
    /// Only the last occurrence of the header is honored.
    pub fn capture(&self, headers: &HeaderMap) -> Result<Option<Observation>, HeaderParseError> {
        let Some(value) = header::last_value(headers, &self.header) else {
            return Ok(None);
        };
        let signal = RetryAfter::from_header_value(value)?;
        let observed_at = self.clock.now();
        let until = signal.deadline(observed_at)?;
        Ok(Some(Observation { until, observed_at }))
    }

    /// Store an observed deadline under `key`, replacing any previous one.
    pub async fn record(&self, key: &str, observation: Observation) -> GateResult<DateTime<Utc>> {
        let ttl = observation.ttl(self.config.ttl_margin());
        let value = header::format_timestamp(observation.until);
        debug!(key, until = %value, ttl_secs = ttl.as_secs(), "recording retry-after deadline");

        self.cache
            .set(key, value, ttl)
            .await
            .map_err(|e| CacheError::new(CacheOp::Set, key, e))?;
        Ok(observation.until)
    }

    /// [`capture`](Self::capture) then [`record`](Self::record).
    ///
    /// Returns the recorded deadline, or `None` if the headers carried no signal.
    pub async fn observe(&self, key: &str, headers: &HeaderMap) -> GateResult<Option<DateTime<Utc>>> {
        match self.capture(headers)? {
            Some(observation) => self.record(key, observation).await.map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::clock::ManualClock;
    use chrono::{TimeDelta, TimeZone};
    use http::HeaderValue;
    use serde_json::json;
    use std::time::Duration;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2015, 10, 21, 7, 27, 58).unwrap()
    }

    fn gate(clock: &ManualClock) -> RetryAfterGate<InMemoryCache> {
        RetryAfterGate::new(InMemoryCache::new().with_clock(clock.clone())).with_clock(clock.clone())
    }

    fn retry_after(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::RETRY_AFTER, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn option_key_overrides_default() {
        let config = RetryAfterConfig::builder().default_key("default").build().unwrap();
        let gate = RetryAfterGate::with_config(InMemoryCache::new(), config).unwrap();

        let options = RequestOptions::cache_key("override");
        assert_eq!(gate.resolve_key(Some(&options)).unwrap().as_deref(), Some("override"));
        assert_eq!(gate.resolve_key(None).unwrap().as_deref(), Some("default"));
    }

    #[test]
    fn malformed_option_is_rejected_even_with_default() {
        let config = RetryAfterConfig::builder().default_key("default").build().unwrap();
        let gate = RetryAfterGate::with_config(InMemoryCache::new(), config).unwrap();

        let options = RequestOptions::new().with(REQUEST_OPTION, json!(123));
        let err = gate.resolve_key(Some(&options)).unwrap_err();
        assert_eq!(err.given(), KeyKind::Integer);
    }

    #[test]
    fn missing_key_follows_policy() {
        let gate = RetryAfterGate::new(InMemoryCache::new());
        assert_eq!(gate.resolve_key(None).unwrap_err().given(), KeyKind::Missing);
        assert_eq!(
            gate.resolve_key(Some(&RequestOptions::new())).unwrap_err().given(),
            KeyKind::Missing
        );

        let config =
            RetryAfterConfig::builder().missing_key(MissingKeyPolicy::PassThrough).build().unwrap();
        let gate = RetryAfterGate::with_config(InMemoryCache::new(), config).unwrap();
        assert_eq!(gate.resolve_key(None).unwrap(), None);
    }

    #[tokio::test]
    async fn unknown_key_is_open() {
        let clock = ManualClock::new(start());
        assert!(gate(&clock).check("k").await.is_ok());
    }

    #[tokio::test]
    async fn block_window_is_boundary_inclusive() {
        let clock = ManualClock::new(start());
        let gate = gate(&clock);

        let until = gate.observe("k", &retry_after("2")).await.unwrap().unwrap();
        assert_eq!(until, start() + TimeDelta::seconds(2));

        let err = gate.check("k").await.unwrap_err();
        let blocked = err.rate_limited().unwrap();
        assert_eq!(blocked.until(), until);
        assert_eq!(blocked.checked_at(), start());

        clock.set(until);
        assert!(gate.check("k").await.unwrap_err().is_rate_limited());

        clock.advance(TimeDelta::microseconds(1));
        assert!(gate.check("k").await.is_ok());
    }

    #[tokio::test]
    async fn other_keys_are_unaffected() {
        let clock = ManualClock::new(start());
        let gate = gate(&clock);
        gate.observe("a", &retry_after("60")).await.unwrap();
        assert!(gate.check("a").await.is_err());
        assert!(gate.check("b").await.is_ok());
    }

    #[tokio::test]
    async fn date_signal_is_stored_exactly() {
        let clock = ManualClock::new(start());
        let gate = gate(&clock);
        gate.observe("k", &retry_after("Wed, 21 Oct 2015 07:28:00 GMT")).await.unwrap();

        let stored = gate.cache().get("k").await.unwrap().unwrap();
        assert_eq!(stored, "2015-10-21T07:28:00.000000+00:00");
        assert_eq!(gate.cache().expires_at("k"), Some(start() + TimeDelta::seconds(3)));
    }

    #[tokio::test]
    async fn newer_signal_overwrites_older() {
        let clock = ManualClock::new(start());
        let gate = gate(&clock);
        gate.observe("k", &retry_after("60")).await.unwrap();
        gate.observe("k", &retry_after("1")).await.unwrap();

        clock.advance(TimeDelta::seconds(1) + TimeDelta::microseconds(1));
        assert!(gate.check("k").await.is_ok());
    }

    #[tokio::test]
    async fn no_header_records_nothing() {
        let clock = ManualClock::new(start());
        let gate = gate(&clock);
        assert_eq!(gate.observe("k", &HeaderMap::new()).await.unwrap(), None);
        assert!(gate.cache().is_empty());
    }

    #[tokio::test]
    async fn malformed_header_is_an_error() {
        let clock = ManualClock::new(start());
        let gate = gate(&clock);
        let err = gate.observe("k", &retry_after("later")).await.unwrap_err();
        assert!(err.is_invalid_header());
        assert!(gate.cache().is_empty());
    }

    #[tokio::test]
    async fn corrupt_cache_entry_is_reported() {
        let clock = ManualClock::new(start());
        let gate = gate(&clock);
        gate.cache().set("k", "not a date".into(), Duration::from_secs(10)).await.unwrap();
        let err = gate.check("k").await.unwrap_err();
        assert!(matches!(err, RetryAfterError::InvalidCacheEntry { ref value, .. } if value == "not a date"));
    }

    #[tokio::test]
    async fn custom_header_name() {
        let clock = ManualClock::new(start());
        let config = RetryAfterConfig::builder().header("x-ratelimit-retry-after").build().unwrap();
        let gate = RetryAfterGate::with_config(InMemoryCache::new().with_clock(clock.clone()), config)
            .unwrap()
            .with_clock(clock.clone());

        let mut headers = retry_after("5");
        assert_eq!(gate.observe("k", &headers).await.unwrap(), None);

        headers.insert("x-ratelimit-retry-after", HeaderValue::from_static("5"));
        assert_eq!(
            gate.observe("k", &headers).await.unwrap(),
            Some(start() + TimeDelta::seconds(5))
        );
    }
}
