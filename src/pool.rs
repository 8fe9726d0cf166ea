//! Connection pool for backend HTTP connections
//!
//! Keeps connections to container endpoints alive across proxied requests.

use crate::config::ProxyConfig;
use crate::registry::Endpoint;
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::header::HOST;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Error type for connection pool operations
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),

    #[error("request build error: {0}")]
    RequestBuild(String),
}

/// Statistics for the connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Total number of requests sent to backends
    pub total_requests: AtomicU64,
    /// Requests that never produced a backend response
    pub failed_requests: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
    /// TCP connect timeout; `None` waits as long as the OS does
    pub connect_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
            connect_timeout: Some(Duration::from_secs(10)),
        }
    }
}

impl From<&ProxyConfig> for PoolConfig {
    fn from(config: &ProxyConfig) -> Self {
        Self {
            max_idle_per_host: config.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(config.pool_idle_timeout_secs),
            connect_timeout: config.connect_timeout(),
        }
    }
}

/// A connection pool for HTTP connections to backend servers
pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl ConnectionPool {
    /// Create a new connection pool with the given configuration
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);
        connector.set_connect_timeout(config.connect_timeout);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            connect_timeout_ms = config.connect_timeout.map(|d| d.as_millis() as u64),
            "Connection pool initialized"
        );

        Self {
            client,
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Send a request to `endpoint`, keeping method, path, query, headers and
    /// body. The Host header is rewritten to the endpoint authority.
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        endpoint: Endpoint,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let backend_req = build_backend_request(req, &endpoint)?;

        self.stats.record_request();

        let response = match self.client.request(backend_req).await {
            Ok(response) => response,
            Err(e) => {
                self.stats.record_failure();
                return Err(e.into());
            }
        };

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// Re-target a client request at `endpoint`
pub fn build_backend_request<B>(req: Request<B>, endpoint: &Endpoint) -> Result<Request<B>, PoolError> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri = format!("{}{}", endpoint.url(), path);
    let authority = endpoint.to_string();

    let (parts, body) = req.into_parts();
    let mut builder = Request::builder()
        .method(parts.method)
        .uri(&uri);

    for (key, value) in parts.headers.iter() {
        if key == HOST {
            continue;
        }
        builder = builder.header(key, value);
    }
    builder = builder.header(HOST, authority);

    builder
        .body(body)
        .map_err(|e| PoolError::RequestBuild(e.to_string()))
}
