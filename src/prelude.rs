//! Convenient re-exports for common retry-gate types.
pub use crate::{
    cache::{InMemoryCache, RetryAfterCache},
    config::{MissingKeyPolicy, RetryAfterConfig},
    error::{RateLimited, RetryAfterError},
    middleware::RetryAfterLayer,
    options::{RequestOptions, REQUEST_OPTION},
    status::{AttachedResponse, ErrorForStatusLayer},
};
