use futures::future;
use http::{Request, Response};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;
use tracing::warn;

use crate::cache::RetryAfterCache;
use crate::clock::Clock;
use crate::config::{ConfigError, RetryAfterConfig};
use crate::error::RetryAfterError;
use crate::gate::RetryAfterGate;
use crate::options::RequestOptions;
use crate::status::{ExtractHeaders, FromAttached};

/// A layer that short-circuits requests while their key has an active `Retry-After` deadline.
///
/// # Example
/// ```
/// use retry_gate::{InMemoryCache, RequestOptions, RetryAfterLayer};
/// use std::convert::Infallible;
/// use tower::{service_fn, ServiceBuilder, ServiceExt};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let svc = ServiceBuilder::new()
///     .layer(RetryAfterLayer::new(InMemoryCache::new()))
///     .service(service_fn(|_req: http::Request<()>| async {
///         Ok::<_, Infallible>(http::Response::new("ok"))
///     }));
///
/// let mut request = http::Request::new(());
/// request.extensions_mut().insert(RequestOptions::cache_key("api"));
/// let response = svc.oneshot(request).await.unwrap();
/// assert_eq!(*response.body(), "ok");
/// # }
/// ```
#[derive(Debug)]
pub struct RetryAfterLayer<C, X = FromAttached> {
    gate: RetryAfterGate<C>,
    extract: X,
}

impl<C, X: Clone> Clone for RetryAfterLayer<C, X> {
    fn clone(&self) -> Self {
        Self { gate: self.gate.clone(), extract: self.extract.clone() }
    }
}

impl<C> RetryAfterLayer<C>
where
    C: RetryAfterCache + 'static,
{
    /// Create a layer requiring a per-request cache key.
    pub fn new(cache: C) -> Self {
        Self::from_gate(RetryAfterGate::new(cache))
    }

    /// Create a layer from a validated config.
    pub fn with_config(cache: C, config: RetryAfterConfig) -> Result<Self, ConfigError> {
        Ok(Self::from_gate(RetryAfterGate::with_config(cache, config)?))
    }

    /// Wrap an existing gate, sharing its cache and clock.
    pub fn from_gate(gate: RetryAfterGate<C>) -> Self {
        Self { gate, extract: FromAttached }
    }
}

impl<C, X> RetryAfterLayer<C, X>
where
    C: RetryAfterCache + 'static,
{
    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<K: Clock + 'static>(self, clock: K) -> Self {
        Self { gate: self.gate.with_clock(clock), extract: self.extract }
    }

    /// Choose how `Retry-After` is found on failed calls.
    ///
    /// Defaults to [`FromAttached`]. Use [`ExtractFn`](crate::ExtractFn) for error types
    /// that cannot implement [`AttachedResponse`](crate::AttachedResponse).
    pub fn extract_headers<Y>(self, extract: Y) -> RetryAfterLayer<C, Y> {
        RetryAfterLayer { gate: self.gate, extract }
    }

    pub fn gate(&self) -> &RetryAfterGate<C> {
        &self.gate
    }
}

impl<S, C, X: Clone> Layer<S> for RetryAfterLayer<C, X> {
    type Service = RetryAfterService<S, C, X>;

    fn layer(&self, service: S) -> Self::Service {
        RetryAfterService { inner: service, gate: self.gate.clone(), extract: self.extract.clone() }
    }
}

/// Middleware service that enforces `Retry-After` windows.
#[derive(Debug)]
pub struct RetryAfterService<S, C, X = FromAttached> {
    inner: S,
    gate: RetryAfterGate<C>,
    extract: X,
}

impl<S: Clone, C, X: Clone> Clone for RetryAfterService<S, C, X> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), gate: self.gate.clone(), extract: self.extract.clone() }
    }
}

impl<S, C, X> RetryAfterService<S, C, X> {
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S, C, X, ReqBody, ResBody> Service<Request<ReqBody>> for RetryAfterService<S, C, X>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    C: RetryAfterCache + 'static,
    X: ExtractHeaders<S::Error> + Clone + Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = RetryAfterError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(RetryAfterError::Inner)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        // Keep the instance that was driven to readiness.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let gate = self.gate.clone();

        let key = match gate.resolve_key(req.extensions().get::<RequestOptions>()) {
            Ok(Some(key)) => key,
            Ok(None) => {
                let fut = inner.call(req);
                return Box::pin(async move { fut.await.map_err(RetryAfterError::Inner) });
            }
            Err(e) => {
                let err = e.with_request(req);
                return Box::pin(future::ready(Err::<Self::Response, Self::Error>(err.into())));
            }
        };

        Box::pin(forward(gate, inner, self.extract.clone(), key, req))
    }
}

/// Pre-flight check, forward, then post-flight capture on both outcomes.
///
/// On the failure path the handler's error always wins: a malformed `Retry-After` or a
/// failing cache write is logged and the original error is returned, since replacing it
/// would hide why the call failed.
async fn forward<S, C, X, ReqBody, ResBody>(
    gate: RetryAfterGate<C>,
    mut inner: S,
    extract: X,
    key: String,
    req: Request<ReqBody>,
) -> Result<Response<ResBody>, RetryAfterError<S::Error>>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    C: RetryAfterCache + 'static,
    X: ExtractHeaders<S::Error>,
    ReqBody: Send + 'static,
{
    if let Err(e) = gate.check(&key).await {
        let err = match e {
            RetryAfterError::RateLimited(blocked) => {
                RetryAfterError::RateLimited(blocked.with_request(req))
            }
            other => other.widen(),
        };
        return Err(err);
    }

    match inner.call(req).await {
        Ok(response) => {
            if let Some(observation) = gate.capture(response.headers())? {
                gate.record(&key, observation).await.map_err(RetryAfterError::widen)?;
            }
            Ok(response)
        }
        Err(err) => {
            let captured = extract.extract(&err).map(|headers| gate.capture(headers));
            match captured {
                Some(Ok(Some(observation))) => {
                    if let Err(e) = gate.record(&key, observation).await {
                        warn!(
                            key = %key,
                            error = %e,
                            "failed to record retry-after deadline from error response; returning the handler error"
                        );
                    }
                }
                Some(Err(e)) => {
                    warn!(
                        key = %key,
                        error = %e,
                        "malformed Retry-After on error response; returning the handler error"
                    );
                }
                Some(Ok(None)) | None => {}
            }
            Err(RetryAfterError::Inner(err))
        }
    }
}
