//! Request forwarding to the Docker daemon behind the tunnel
//!
//! Only GET and POST are forwarded. GET goes out without a body; POST
//! carries the inbound body with a JSON content type. Responses come back
//! with their status and body untouched, and the body is streamed rather
//! than buffered.

use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::{Method, Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Error type for forwarding operations
#[derive(Debug, Error)]
pub enum TransportError {
    /// Error from the HTTP client
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    /// Error building a request
    #[error("request build error: {0}")]
    RequestBuild(String),
}

/// Outcome of a forwarding attempt
pub enum Forwarded {
    /// The upstream response, status and streaming body untouched
    Response(Response<BoxBody<Bytes, hyper::Error>>),
    /// The method is neither GET nor POST; nothing was sent upstream
    Unsupported,
}

/// Counters for forwarded traffic
#[derive(Debug, Default)]
pub struct TransportStats {
    pub total_requests: AtomicU64,
    pub unsupported: AtomicU64,
}

impl TransportStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unsupported(&self) {
        self.unsupported.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_unsupported(&self) -> u64 {
        self.unsupported.load(Ordering::Relaxed)
    }
}

/// Connection pool settings for the upstream client
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Build the upstream URL for a request path and raw query
pub fn target_url(host: &str, port: u16, path: &str, query: Option<&str>) -> String {
    match query {
        Some(q) if !q.is_empty() => format!("http://{}:{}{}?{}", host, port, path, q),
        _ => format!("http://{}:{}{}", host, port, path),
    }
}

/// Forwards requests over a pooled HTTP client
pub struct Transport {
    client: Client<HttpConnector, BoxBody<Bytes, hyper::Error>>,
    stats: Arc<TransportStats>,
}

impl Transport {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Upstream client initialized"
        );

        Self {
            client,
            stats: Arc::new(TransportStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<TransportStats> {
        Arc::clone(&self.stats)
    }

    /// Forward `req` to `target`
    pub async fn forward(
        &self,
        target: &str,
        req: Request<Incoming>,
    ) -> Result<Forwarded, TransportError> {
        let (parts, body) = req.into_parts();

        let upstream_req = match parts.method {
            Method::GET => Request::builder()
                .method(Method::GET)
                .uri(target)
                .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed()),
            Method::POST => Request::builder()
                .method(Method::POST)
                .uri(target)
                .header(hyper::header::CONTENT_TYPE, "application/json")
                .body(body.boxed()),
            _ => {
                self.stats.record_unsupported();
                return Ok(Forwarded::Unsupported);
            }
        }
        .map_err(|e| TransportError::RequestBuild(e.to_string()))?;

        self.stats.record_request();

        let response = self.client.request(upstream_req).await?;
        let (parts, body) = response.into_parts();

        Ok(Forwarded::Response(Response::from_parts(parts, body.boxed())))
    }
}
