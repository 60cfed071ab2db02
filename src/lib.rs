#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # retry-gate
//!
//! Tower middleware that honors server-advertised `Retry-After` backoff.
//!
//! When a response (successful or not) carries `Retry-After`, the gate records a deadline
//! under the request's cache key. Until that deadline has strictly passed, further
//! requests with the same key fail fast with [`RetryAfterError::RateLimited`] instead of
//! reaching the network.
//!
//! The gate never retries. It blocks and reports, leaving retry orchestration to the caller.
//!
//! ## Features
//!
//! - **Both header encodings**: delta-seconds and HTTP-date
//! - **Boundary-inclusive windows**: a request at the exact deadline is still blocked
//! - **Error responses count**: failures carrying a response (see [`AttachedResponse`])
//!   update the deadline just like successes, even behind layers that box their errors
//! - **Pluggable storage** via [`RetryAfterCache`], with an [`InMemoryCache`] included
//!
//! ## Quick Start
//!
//! ```rust
//! use retry_gate::{ErrorForStatusLayer, InMemoryCache, RequestOptions, RetryAfterLayer};
//! use std::convert::Infallible;
//! use tower::{service_fn, ServiceBuilder, ServiceExt};
//!
//! #[tokio::main]
//! async fn main() {
//!     let transport = service_fn(|_req: http::Request<()>| async {
//!         let response = http::Response::builder()
//!             .status(429)
//!             .header("Retry-After", "30")
//!             .body(())
//!             .unwrap();
//!         Ok::<_, Infallible>(response)
//!     });
//!
//!     let client = ServiceBuilder::new()
//!         .layer(RetryAfterLayer::new(InMemoryCache::new()))
//!         .layer(ErrorForStatusLayer::new())
//!         .service(transport);
//!
//!     let request = || {
//!         let mut req = http::Request::new(());
//!         req.extensions_mut().insert(RequestOptions::cache_key("telegram"));
//!         req
//!     };
//!
//!     // The 429 is surfaced unchanged and its Retry-After is remembered.
//!     let first = client.clone().oneshot(request()).await.unwrap_err();
//!     assert!(first.is_inner());
//!
//!     // Subsequent requests fail fast for the next 30 seconds.
//!     let second = client.oneshot(request()).await.unwrap_err();
//!     assert!(second.is_rate_limited());
//! }
//! ```

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod gate;
pub mod header;
pub mod middleware;
pub mod options;
pub mod prelude;
pub mod status;

// Re-exports
pub use cache::{InMemoryCache, RetryAfterCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, MissingKeyPolicy, RetryAfterConfig, RetryAfterConfigBuilder};
pub use error::{CacheError, InvalidCacheKey, RateLimited, RequestLine, RetryAfterError};
pub use gate::RetryAfterGate;
pub use header::{HeaderParseError, RetryAfter};
pub use middleware::{RetryAfterLayer, RetryAfterService};
pub use options::{KeyKind, RequestOptions, REQUEST_OPTION};
pub use status::{
    AttachedResponse, ErrorForStatusLayer, ExtractFn, ExtractHeaders, FromAttached, IgnoreFailures,
    ResponseError, StatusError,
};
