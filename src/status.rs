//! Turning error statuses into errors that still carry their response.
//!
//! Rate-limit signals usually arrive on `429 Too Many Requests` or `503 Service
//! Unavailable`. Clients that treat those as failures must keep the response around so
//! the gate can read its headers on the failure path; [`AttachedResponse`] is how an
//! error type exposes them, and [`ExtractHeaders`] is how the gate asks for them.
//!
//! [`StatusError`] erases the body type, so it survives layers that box their errors
//! (`timeout`, `buffer`, `concurrency_limit`): the gate finds it again by walking the
//! boxed error's `source()` chain.

use http::response::Parts;
use http::{HeaderMap, Response, StatusCode};
use pin_project::pin_project;
use std::any::Any;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// Errors that may embed an HTTP response.
pub trait AttachedResponse {
    /// Headers of the embedded response, if the failure has one.
    fn attached_headers(&self) -> Option<&HeaderMap> {
        None
    }
}

impl AttachedResponse for std::convert::Infallible {}

impl AttachedResponse for std::io::Error {}

impl AttachedResponse for tower::BoxError {
    fn attached_headers(&self) -> Option<&HeaderMap> {
        find_status_error(&**self).map(StatusError::headers)
    }
}

/// Search `error` and its `source()` chain for a [`StatusError`].
pub fn find_status_error<'a>(error: &'a (dyn Error + 'static)) -> Option<&'a StatusError> {
    let mut current = Some(error);
    while let Some(err) = current {
        if let Some(status) = err.downcast_ref::<StatusError>() {
            return Some(status);
        }
        current = err.source();
    }
    None
}

/// How the gate finds response headers on a failed call.
pub trait ExtractHeaders<E> {
    fn extract<'a>(&self, error: &'a E) -> Option<&'a HeaderMap>;
}

/// Ask the error itself through [`AttachedResponse`]. The default.
#[derive(Debug, Clone, Copy, Default)]
pub struct FromAttached;

impl<E: AttachedResponse> ExtractHeaders<E> for FromAttached {
    fn extract<'a>(&self, error: &'a E) -> Option<&'a HeaderMap> {
        error.attached_headers()
    }
}

/// Never look at failures; only successful responses move deadlines.
#[derive(Debug, Clone, Copy, Default)]
pub struct IgnoreFailures;

impl<E> ExtractHeaders<E> for IgnoreFailures {
    fn extract<'a>(&self, _error: &'a E) -> Option<&'a HeaderMap> {
        None
    }
}

/// Extract with a plain function, for error types from other crates.
///
/// ```
/// use http::HeaderMap;
/// use retry_gate::{ExtractFn, InMemoryCache, RetryAfterLayer};
///
/// #[derive(Debug)]
/// struct UpstreamError {
///     headers: HeaderMap,
/// }
///
/// fn upstream_headers(error: &UpstreamError) -> Option<&HeaderMap> {
///     Some(&error.headers)
/// }
///
/// let layer = RetryAfterLayer::new(InMemoryCache::new())
///     .extract_headers(ExtractFn::new(upstream_headers));
/// # let _ = layer;
/// ```
pub struct ExtractFn<E>(fn(&E) -> Option<&HeaderMap>);

impl<E> ExtractFn<E> {
    pub fn new(f: fn(&E) -> Option<&HeaderMap>) -> Self {
        Self(f)
    }
}

impl<E> Clone for ExtractFn<E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E> Copy for ExtractFn<E> {}

impl<E> fmt::Debug for ExtractFn<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ExtractFn")
    }
}

impl<E> ExtractHeaders<E> for ExtractFn<E> {
    fn extract<'a>(&self, error: &'a E) -> Option<&'a HeaderMap> {
        (self.0)(error)
    }
}

/// A response whose status is 4xx or 5xx.
///
/// The body is kept type-erased; get the response back with
/// [`into_response`](Self::into_response).
pub struct StatusError {
    parts: Parts,
    body: Box<dyn Any + Send + Sync>,
}

impl StatusError {
    pub fn new<B: Send + Sync + 'static>(response: Response<B>) -> Self {
        let (parts, body) = response.into_parts();
        Self { parts, body: Box::new(body) }
    }

    pub fn status(&self) -> StatusCode {
        self.parts.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.parts.headers
    }

    /// Recover the response. Fails, returning `self`, if `B` is not the body type it was
    /// created with.
    pub fn into_response<B: 'static>(self) -> Result<Response<B>, Self> {
        match self.body.downcast::<B>() {
            Ok(body) => Ok(Response::from_parts(self.parts, *body)),
            Err(body) => Err(Self { parts: self.parts, body }),
        }
    }
}

impl fmt::Debug for StatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusError")
            .field("status", &self.parts.status)
            .field("headers", &self.parts.headers)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for StatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.parts.status;
        let kind = if status.is_client_error() { "Client" } else { "Server" };
        write!(f, "{} error: {}", kind, status)
    }
}

impl Error for StatusError {}

impl AttachedResponse for StatusError {
    fn attached_headers(&self) -> Option<&HeaderMap> {
        Some(self.headers())
    }
}

/// Failure of a service wrapped in [`ErrorForStatusLayer`].
#[derive(Debug)]
pub enum ResponseError<E> {
    /// The transport produced an error status.
    Status(StatusError),
    /// The transport itself failed.
    Transport(E),
}

impl<E> ResponseError<E> {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Status(e) => Some(e.status()),
            Self::Transport(_) => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for ResponseError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(e) => write!(f, "{}", e),
            Self::Transport(e) => write!(f, "{}", e),
        }
    }
}

impl<E> Error for ResponseError<E>
where
    E: Error + 'static,
{
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Status(e) => Some(e),
            Self::Transport(e) => Some(e),
        }
    }
}

// Transport failures never carry a response, whatever `E` is.
impl<E> AttachedResponse for ResponseError<E> {
    fn attached_headers(&self) -> Option<&HeaderMap> {
        match self {
            Self::Status(e) => Some(e.headers()),
            Self::Transport(_) => None,
        }
    }
}

/// Layer that fails responses with a 4xx/5xx status.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorForStatusLayer;

impl ErrorForStatusLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for ErrorForStatusLayer {
    type Service = ErrorForStatus<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ErrorForStatus { inner }
    }
}

#[derive(Debug, Clone)]
pub struct ErrorForStatus<S> {
    inner: S,
}

impl<S, Req, B> Service<Req> for ErrorForStatus<S>
where
    S: Service<Req, Response = Response<B>>,
    B: Send + Sync + 'static,
{
    type Response = Response<B>;
    type Error = ResponseError<S::Error>;
    type Future = ErrorForStatusFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(ResponseError::Transport)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        ErrorForStatusFuture { inner: self.inner.call(req) }
    }
}

#[pin_project]
#[derive(Debug)]
pub struct ErrorForStatusFuture<F> {
    #[pin]
    inner: F,
}

impl<F, B, E> Future for ErrorForStatusFuture<F>
where
    F: Future<Output = Result<Response<B>, E>>,
    B: Send + Sync + 'static,
{
    type Output = Result<Response<B>, ResponseError<E>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let result = match ready!(this.inner.poll(cx)) {
            Ok(response) if response.status().is_client_error() || response.status().is_server_error() => {
                Err(ResponseError::Status(StatusError::new(response)))
            }
            Ok(response) => Ok(response),
            Err(e) => Err(ResponseError::Transport(e)),
        };
        Poll::Ready(result)
    }
}
