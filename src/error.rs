//! Error types surfaced by the retry-after gate
use chrono::{DateTime, Utc};
use http::{Method, Request, Uri};
use std::any::Any;
use std::convert::Infallible;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::header::{format_timestamp, HeaderParseError};
use crate::options::{KeyKind, REQUEST_OPTION};

/// Method and URI of the request an error refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: Method,
    pub uri: Uri,
}

impl<B> From<&http::Request<B>> for RequestLine {
    fn from(request: &http::Request<B>) -> Self {
        Self { method: request.method().clone(), uri: request.uri().clone() }
    }
}

impl fmt::Display for RequestLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.uri)
    }
}

/// A request that never reached the wrapped service, body type erased.
// The mutex only makes the erased body `Sync`; it is never locked.
struct Unsent(Mutex<Request<Box<dyn Any + Send>>>);

impl Unsent {
    fn new<B: Send + 'static>(request: Request<B>) -> Self {
        Self(Mutex::new(request.map(|body| Box::new(body) as Box<dyn Any + Send>)))
    }

    fn into_request<B: 'static>(self) -> Option<Request<B>> {
        let (parts, body) = self.0.into_inner().unwrap_or_else(PoisonError::into_inner).into_parts();
        body.downcast::<B>().ok().map(|body| Request::from_parts(parts, *body))
    }
}

impl fmt::Debug for Unsent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Unsent")
    }
}

/// The cache-key option was missing or not a non-empty string.
#[derive(Debug)]
pub struct InvalidCacheKey {
    given: KeyKind,
    request: Option<RequestLine>,
    unsent: Option<Unsent>,
}

impl InvalidCacheKey {
    pub fn new(given: KeyKind) -> Self {
        Self { given, request: None, unsent: None }
    }

    pub(crate) fn with_request<B: Send + 'static>(mut self, request: Request<B>) -> Self {
        self.request = Some(RequestLine::from(&request));
        self.unsent = Some(Unsent::new(request));
        self
    }

    /// What was supplied instead of a key.
    pub fn given(&self) -> KeyKind {
        self.given
    }

    /// Method and URI of the rejected request.
    pub fn request(&self) -> Option<&RequestLine> {
        self.request.as_ref()
    }

    /// Take back the rejected request, if `B` is its body type.
    pub fn into_request<B: 'static>(self) -> Option<Request<B>> {
        self.unsent.and_then(Unsent::into_request)
    }
}

impl fmt::Display for InvalidCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Request option {} must be a non empty string, {} given.", REQUEST_OPTION, self.given)
    }
}

impl std::error::Error for InvalidCacheKey {}

/// A request was short-circuited because its key has an active retry-after deadline.
///
/// The unsent request travels with the error so it can be resubmitted once
/// [`remaining`](Self::remaining) has elapsed.
#[derive(Debug)]
pub struct RateLimited {
    key: String,
    until: DateTime<Utc>,
    checked_at: DateTime<Utc>,
    request: Option<RequestLine>,
    unsent: Option<Unsent>,
}

impl RateLimited {
    pub fn new(key: impl Into<String>, until: DateTime<Utc>, checked_at: DateTime<Utc>) -> Self {
        Self { key: key.into(), until, checked_at, request: None, unsent: None }
    }

    pub(crate) fn with_request<B: Send + 'static>(mut self, request: Request<B>) -> Self {
        self.request = Some(RequestLine::from(&request));
        self.unsent = Some(Unsent::new(request));
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Deadline requests for this key are blocked until (inclusive).
    pub fn until(&self) -> DateTime<Utc> {
        self.until
    }

    /// Instant the deadline was checked at.
    pub fn checked_at(&self) -> DateTime<Utc> {
        self.checked_at
    }

    /// Time left in the window as of the check. Zero at the boundary itself.
    pub fn remaining(&self) -> Duration {
        (self.until - self.checked_at).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn request(&self) -> Option<&RequestLine> {
        self.request.as_ref()
    }

    /// Take back the blocked request, if `B` is its body type.
    pub fn into_request<B: 'static>(self) -> Option<Request<B>> {
        self.unsent.and_then(Unsent::into_request)
    }
}

impl fmt::Display for RateLimited {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Retry after {}. Checked at {}.",
            format_timestamp(self.until),
            format_timestamp(self.checked_at)
        )
    }
}

impl std::error::Error for RateLimited {}

/// Cache operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOp {
    Get,
    Set,
}

impl fmt::Display for CacheOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CacheOp::Get => "get",
            CacheOp::Set => "set",
        })
    }
}

/// The backing store failed.
#[derive(Debug, thiserror::Error)]
#[error("retry-after cache {op} failed for key `{key}`")]
pub struct CacheError {
    op: CacheOp,
    key: String,
    #[source]
    source: Box<dyn std::error::Error + Send + Sync>,
}

impl CacheError {
    pub fn new<E>(op: CacheOp, key: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self { op, key: key.into(), source: Box::new(source) }
    }

    pub fn op(&self) -> CacheOp {
        self.op
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Unified error type for the gated service.
#[derive(Debug)]
pub enum RetryAfterError<E> {
    /// The cache-key option was missing or malformed; nothing was sent.
    InvalidCacheKey(InvalidCacheKey),
    /// The key has an active deadline; nothing was sent.
    RateLimited(RateLimited),
    /// A response carried a `Retry-After` value that could not be parsed.
    InvalidHeader(HeaderParseError),
    /// The cache held something that is not a timestamp.
    InvalidCacheEntry { key: String, value: String },
    /// The cache store failed.
    Cache(CacheError),
    /// The wrapped service failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for RetryAfterError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidCacheKey(e) => write!(f, "{}", e),
            Self::RateLimited(e) => write!(f, "{}", e),
            Self::InvalidHeader(e) => write!(f, "invalid Retry-After header: {}", e),
            Self::InvalidCacheEntry { key, value } => {
                write!(f, "cached retry-after deadline for `{}` is not a timestamp: `{}`", key, value)
            }
            Self::Cache(e) => write!(f, "{}", e),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RetryAfterError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::InvalidHeader(e) => Some(e),
            Self::Cache(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> From<InvalidCacheKey> for RetryAfterError<E> {
    fn from(e: InvalidCacheKey) -> Self {
        Self::InvalidCacheKey(e)
    }
}

impl<E> From<RateLimited> for RetryAfterError<E> {
    fn from(e: RateLimited) -> Self {
        Self::RateLimited(e)
    }
}

impl<E> From<HeaderParseError> for RetryAfterError<E> {
    fn from(e: HeaderParseError) -> Self {
        Self::InvalidHeader(e)
    }
}

impl<E> From<CacheError> for RetryAfterError<E> {
    fn from(e: CacheError) -> Self {
        Self::Cache(e)
    }
}

impl RetryAfterError<Infallible> {
    /// Re-type a gate-only error for a service whose inner error is `E`.
    pub fn widen<E>(self) -> RetryAfterError<E> {
        match self {
            Self::InvalidCacheKey(e) => RetryAfterError::InvalidCacheKey(e),
            Self::RateLimited(e) => RetryAfterError::RateLimited(e),
            Self::InvalidHeader(e) => RetryAfterError::InvalidHeader(e),
            Self::InvalidCacheEntry { key, value } => RetryAfterError::InvalidCacheEntry { key, value },
            Self::Cache(e) => RetryAfterError::Cache(e),
            Self::Inner(never) => match never {},
        }
    }
}

impl<E> RetryAfterError<E> {
    /// Check if the request was blocked by an active deadline
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }
    /// Check if the request was rejected for a bad cache key
    pub fn is_invalid_cache_key(&self) -> bool {
        matches!(self, Self::InvalidCacheKey(_))
    }
    /// Check if a response carried an unparsable `Retry-After`
    pub fn is_invalid_header(&self) -> bool {
        matches!(self, Self::InvalidHeader(_))
    }
    /// Check if this error wraps an inner error.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }
    /// Block details, if the request was rate limited.
    pub fn rate_limited(&self) -> Option<&RateLimited> {
        match self {
            Self::RateLimited(e) => Some(e),
            _ => None,
        }
    }
    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}
