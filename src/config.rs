//! Gate configuration.

use http::header::{HeaderName, RETRY_AFTER};
use std::time::Duration;

/// What to do with a request that has neither a per-request key nor a default key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum MissingKeyPolicy {
    /// Fail with `InvalidCacheKey` before any I/O.
    #[default]
    Reject,
    /// Forward the request without gating it.
    PassThrough,
}

/// Errors produced when validating gate configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Default key must be non-empty when set.
    #[error("default_key must be a non empty string")]
    EmptyDefaultKey,
    /// TTL margin must cover serialization rounding.
    #[error("ttl_margin must be at least 1s (got {0:?})")]
    TtlMarginTooShort(Duration),
    /// Header name is not a valid HTTP header name.
    #[error("invalid header name `{0}`")]
    InvalidHeader(String),
}

/// Validated configuration for the retry-after gate.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RetryAfterConfig {
    default_key: Option<String>,
    missing_key: MissingKeyPolicy,
    ttl_margin: Duration,
    header: String,
}

impl Default for RetryAfterConfig {
    fn default() -> Self {
        Self {
            default_key: None,
            missing_key: MissingKeyPolicy::Reject,
            ttl_margin: Duration::from_secs(1),
            header: RETRY_AFTER.as_str().to_string(),
        }
    }
}

impl RetryAfterConfig {
    pub fn builder() -> RetryAfterConfigBuilder {
        RetryAfterConfigBuilder::new()
    }

    /// Key used when a request does not carry one.
    pub fn default_key(&self) -> Option<&str> {
        self.default_key.as_deref()
    }

    pub fn missing_key_policy(&self) -> MissingKeyPolicy {
        self.missing_key
    }

    /// Extra lifetime given to cached deadlines beyond the window itself.
    pub fn ttl_margin(&self) -> Duration {
        self.ttl_margin
    }

    /// Parsed name of the header carrying the rate-limit signal.
    pub fn header_name(&self) -> Result<HeaderName, ConfigError> {
        HeaderName::from_bytes(self.header.as_bytes())
            .map_err(|_| ConfigError::InvalidHeader(self.header.clone()))
    }

    /// Check invariants; deserialized configs bypass the builder, so the gate calls this too.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_key.as_deref() == Some("") {
            return Err(ConfigError::EmptyDefaultKey);
        }
        if self.ttl_margin < Duration::from_secs(1) {
            return Err(ConfigError::TtlMarginTooShort(self.ttl_margin));
        }
        self.header_name().map(|_| ())
    }
}

/// Builder for [`RetryAfterConfig`].
#[derive(Debug, Clone, Default)]
pub struct RetryAfterConfigBuilder {
    config: RetryAfterConfig,
}

impl RetryAfterConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a key at construction time; per-request options still take precedence.
    pub fn default_key(mut self, key: impl Into<String>) -> Self {
        self.config.default_key = Some(key.into());
        self
    }

    pub fn missing_key(mut self, policy: MissingKeyPolicy) -> Self {
        self.config.missing_key = policy;
        self
    }

    /// Must be >= 1s.
    pub fn ttl_margin(mut self, margin: Duration) -> Self {
        self.config.ttl_margin = margin;
        self
    }

    /// Read the signal from a different header, e.g. `x-ratelimit-retry-after`.
    pub fn header(mut self, name: impl Into<String>) -> Self {
        self.config.header = name.into();
        self
    }

    pub fn build(self) -> Result<RetryAfterConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
