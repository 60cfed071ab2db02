#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::future::{ready, Ready};
use http::{Request, Response, StatusCode};
use std::collections::VecDeque;
use std::convert::Infallible;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tower::Service;

use retry_gate::{RequestOptions, RetryAfterCache, REQUEST_OPTION};

pub const CACHE_KEY: &str = "test_cache_key";
pub const OK_BODY: &str = r#"{"ok":true,"result":{}}"#;
pub const RETRY_AFTER_DATE: &str = "Wed, 21 Oct 2015 07:28:00 GMT";
pub const RETRY_AFTER_SECONDS: i64 = 2;

pub fn retry_after_date() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2015, 10, 21, 7, 28, 0).unwrap()
}

/// Transport that replays queued responses and counts how often it was reached.
#[derive(Clone, Debug, Default)]
pub struct ScriptedTransport {
    script: Arc<Mutex<VecDeque<Response<String>>>>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedTransport {
    pub fn new(responses: Vec<Response<String>>) -> Self {
        Self { script: Arc::new(Mutex::new(responses.into())), calls: Arc::default() }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Service<Request<()>> for ScriptedTransport {
    type Response = Response<String>;
    type Error = Infallible;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: Request<()>) -> Self::Future {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        ready(Ok(next.unwrap_or_else(ok)))
    }
}

pub fn ok() -> Response<String> {
    Response::new(OK_BODY.to_string())
}

pub fn with_retry_after(status: u16, values: &[&str]) -> Response<String> {
    let mut builder = Response::builder().status(StatusCode::from_u16(status).unwrap());
    for value in values {
        builder = builder.header(http::header::RETRY_AFTER, *value);
    }
    builder.body(OK_BODY.to_string()).unwrap()
}

pub fn request_with(options: RequestOptions) -> Request<()> {
    let mut request = Request::post("https://api.example.com/sendMessage").body(()).unwrap();
    request.extensions_mut().insert(options);
    request
}

pub fn keyed_request() -> Request<()> {
    request_with(RequestOptions::cache_key(CACHE_KEY))
}

pub fn unkeyed_request() -> Request<()> {
    Request::post("https://api.example.com/sendMessage").body(()).unwrap()
}

pub fn request_with_raw_key(value: serde_json::Value) -> Request<()> {
    request_with(RequestOptions::new().with(REQUEST_OPTION, value))
}

/// Transport that fails every call without producing a response.
#[derive(Clone, Debug, Default)]
pub struct UnreachableTransport {
    calls: Arc<AtomicUsize>,
}

impl UnreachableTransport {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Service<Request<()>> for UnreachableTransport {
    type Response = Response<String>;
    type Error = io::Error;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: Request<()>) -> Self::Future {
        self.calls.fetch_add(1, Ordering::SeqCst);
        ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer")))
    }
}

/// Cache whose reads or writes fail.
#[derive(Clone, Copy, Debug, Default)]
pub struct BrokenCache {
    pub fail_get: bool,
    pub fail_set: bool,
}

impl BrokenCache {
    pub fn unreadable() -> Self {
        Self { fail_get: true, fail_set: true }
    }

    pub fn unwritable() -> Self {
        Self { fail_get: false, fail_set: true }
    }
}

#[async_trait]
impl RetryAfterCache for BrokenCache {
    type Error = io::Error;

    async fn get(&self, _key: &str) -> Result<Option<String>, Self::Error> {
        if self.fail_get {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "cache down"));
        }
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), Self::Error> {
        if self.fail_set {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "cache down"));
        }
        Ok(())
    }
}
