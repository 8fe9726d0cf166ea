use crate::config::ProxyConfig;
use crate::error::{error_response, ProxyError, ProxyErrorCode};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::registry::{Endpoint, SharedRegistry};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

/// Largest backend handshake response accepted on upgrades
const MAX_UPGRADE_RESPONSE_HEAD: usize = 16 * 1024;

/// Largest body of a refused upgrade relayed to the client
const MAX_REJECTED_UPGRADE_BODY: usize = 1024 * 1024;

/// How long the rest of a refused upgrade's body may take to arrive
const REJECTED_UPGRADE_BODY_TIMEOUT: Duration = Duration::from_secs(10);

type ProxyResponse = Response<BoxBody<Bytes, hyper::Error>>;

/// Subdomain reverse proxy in front of the running services
pub struct ProxyServer {
    listener: TcpListener,
    registry: SharedRegistry,
    shutdown_rx: watch::Receiver<bool>,
    pool: Arc<ConnectionPool>,
    request_timeout: Option<Duration>,
}

impl ProxyServer {
    /// Bind the listening socket. Routing starts with [`ProxyServer::run`].
    pub async fn bind(
        bind_addr: SocketAddr,
        registry: SharedRegistry,
        shutdown_rx: watch::Receiver<bool>,
        config: &ProxyConfig,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind proxy on {}: {}", bind_addr, e))?;
        let pool = Arc::new(ConnectionPool::new(PoolConfig::from(config)));

        Ok(Self {
            listener,
            registry,
            shutdown_rx,
            pool,
            request_timeout: config.request_timeout(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get the connection pool (for statistics)
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.listener.local_addr()?;
        info!(addr = %addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let registry = Arc::clone(&self.registry);
                            let pool = Arc::clone(&self.pool);
                            let request_timeout = self.request_timeout;

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, registry, pool, request_timeout).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    registry: SharedRegistry,
    pool: Arc<ConnectionPool>,
    request_timeout: Option<Duration>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let registry = Arc::clone(&registry);
        let pool = Arc::clone(&pool);
        async move { handle_request(req, registry, pool, addr, request_timeout).await }
    });

    // HTTP/1.1 connections can still use WebSocket upgrades; h2c is served too
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    registry: SharedRegistry,
    pool: Arc<ConnectionPool>,
    client_addr: SocketAddr,
    request_timeout: Option<Duration>,
) -> Result<ProxyResponse, ProxyError> {
    let upgrade = is_upgrade_request(&req);

    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let original_host = request_host(&req).map(String::from);
    let service = match original_host.as_deref().and_then(service_name_from_host) {
        Some(name) => name,
        None if upgrade => {
            debug!(request_id, "Refusing upgrade without a usable Host header");
            return Err(ProxyError::UpgradeWithoutHost);
        }
        None => return Ok(error_response(ProxyErrorCode::MissingHostHeader)),
    };

    let endpoint = match registry.lookup(&service) {
        Some(record) => record.endpoint,
        None => {
            warn!(service, request_id, upgrade, "No running service for subdomain");
            if upgrade {
                return Err(ProxyError::UnknownUpgradeTarget(service));
            }
            return Ok(error_response(ProxyErrorCode::UnknownService));
        }
    };

    // Overwritten rather than appended: this proxy is the first trusted hop
    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Some(value) = original_host.and_then(|h| HeaderValue::from_str(&h).ok()) {
        headers.insert(X_FORWARDED_HOST, value);
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    debug!(service, %endpoint, method = %req.method(), uri = %req.uri(), request_id, "Routing request");

    if upgrade {
        return Ok(handle_upgrade(req, service, endpoint, request_id, pool.config().connect_timeout).await);
    }

    let forward = pool.send_request(req, endpoint);
    let result = match request_timeout {
        Some(limit) => match tokio::time::timeout(limit, forward).await {
            Ok(result) => result,
            Err(_) => {
                warn!(service, %endpoint, timeout_secs = limit.as_secs(), "Request timed out");
                return Ok(error_response(ProxyErrorCode::RequestTimeout));
            }
        },
        None => forward.await,
    };

    match result {
        Ok(response) => Ok(response),
        Err(e) => {
            // Detail stays in the log; the client gets a generic gateway error
            error!(service, %endpoint, error = %e, "Failed to forward request");
            Ok(error_response(ProxyErrorCode::ConnectionFailed))
        }
    }
}

/// Host the client asked for: the Host header, else the URI authority (HTTP/2)
fn request_host<B>(req: &Request<B>) -> Option<&str> {
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))
}

/// Map a Host value to the service name it addresses.
///
/// `Foo.localhost:8000` -> `foo`. Only the first label is used; hosts that are
/// empty, longer than a DNS name, or contain characters outside
/// `[A-Za-z0-9._-]` yield `None`.
pub fn service_name_from_host(host: &str) -> Option<String> {
    let hostname = host.trim().split(':').next()?;

    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }

    // Also keeps control characters out of the logs
    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_')
    {
        return None;
    }

    let label = hostname.split('.').next()?;
    if label.is_empty() {
        return None;
    }

    Some(label.to_ascii_lowercase())
}

/// Check if a request is a protocol upgrade request (e.g. WebSocket)
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    let has_upgrade_header = req.headers().contains_key(hyper::header::UPGRADE);

    has_upgrade_connection && has_upgrade_header
}

fn get_upgrade_type<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
}

/// Forward bytes bidirectionally between client and backend connections
async fn forward_bidirectional(
    client: Upgraded,
    backend: TcpStream,
    early_data: Vec<u8>,
    service: &str,
    request_id: &str,
) {
    let mut client_io = TokioIo::new(client);
    let mut backend_io = backend;

    // Frames the backend sent in the same read as its handshake
    if !early_data.is_empty() {
        if let Err(e) = client_io.write_all(&early_data).await {
            debug!(service, request_id, error = %e, "Client went away before forwarding started");
            return;
        }
    }

    match tokio::io::copy_bidirectional(&mut client_io, &mut backend_io).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(
                service,
                request_id,
                client_to_backend,
                backend_to_client,
                "Upgraded connection closed normally"
            );
        }
        Err(e) => {
            debug!(service, request_id, error = %e, "Upgraded connection closed with error");
        }
    }
}

/// Build the raw HTTP upgrade request to send to the backend
fn build_upgrade_request<B>(req: &Request<B>, endpoint: &Endpoint) -> Vec<u8> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    request.push_str(&format!("Host: {}\r\n", endpoint));
    request.push_str("\r\n");

    request.into_bytes()
}

/// Position just past the `\r\n\r\n` that ends a response head
fn find_head_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

/// Parse the backend's response head: status and headers
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 || !parts[0].starts_with("HTTP/") {
        return None;
    }

    let status_code: u16 = parts[1].parse().ok()?;
    let status = StatusCode::from_u16(status_code).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

/// Read from the backend until a complete response head has arrived.
///
/// Returns the head and whatever bytes followed it.
async fn read_response_head(backend: &mut TcpStream) -> std::io::Result<Option<(Vec<u8>, Vec<u8>)>> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let n = backend.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = find_head_end(&buf) {
            let rest = buf.split_off(end);
            return Ok(Some((buf, rest)));
        }
        if buf.len() > MAX_UPGRADE_RESPONSE_HEAD {
            return Ok(None);
        }
    }
}

/// Complete the body of a refused upgrade up to its declared Content-Length.
///
/// `body` holds the bytes that arrived with the head. Without a declared
/// length only those are relayed.
async fn read_rejected_body(
    backend: &mut TcpStream,
    mut body: Vec<u8>,
    headers: &[(String, String)],
) -> std::io::Result<Vec<u8>> {
    let declared = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.parse::<usize>().ok());
    let Some(declared) = declared else {
        return Ok(body);
    };

    let wanted = declared.min(MAX_REJECTED_UPGRADE_BODY);
    let mut chunk = [0u8; 4096];
    while body.len() < wanted {
        let n = backend.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(wanted);
    Ok(body)
}

async fn connect_backend(endpoint: &Endpoint, connect_timeout: Option<Duration>) -> std::io::Result<TcpStream> {
    let connect = TcpStream::connect(endpoint.socket_addr());
    match connect_timeout {
        Some(limit) => tokio::time::timeout(limit, connect)
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))?,
        None => connect.await,
    }
}

/// Relay an upgrade handshake to the backend and, on 101, splice the streams
async fn handle_upgrade(
    req: Request<Incoming>,
    service: String,
    endpoint: Endpoint,
    request_id: String,
    connect_timeout: Option<Duration>,
) -> ProxyResponse {
    let upgrade_type = get_upgrade_type(&req).unwrap_or_else(|| "unknown".to_string());
    debug!(service, request_id, upgrade_type, "Handling upgrade request");

    let raw_request = build_upgrade_request(&req, &endpoint);

    let mut backend_stream = match connect_backend(&endpoint, connect_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(service, %endpoint, error = %e, "Failed to connect to backend for upgrade");
            return error_response(ProxyErrorCode::ConnectionFailed);
        }
    };

    if let Err(e) = backend_stream.write_all(&raw_request).await {
        error!(service, error = %e, "Failed to send upgrade request to backend");
        return error_response(ProxyErrorCode::ConnectionFailed);
    }

    let (head, early_data) = match read_response_head(&mut backend_stream).await {
        Ok(Some(parts)) => parts,
        Ok(None) => {
            error!(service, "Backend closed or overflowed before completing its upgrade response");
            return error_response(ProxyErrorCode::ConnectionFailed);
        }
        Err(e) => {
            error!(service, error = %e, "Failed to read upgrade response from backend");
            return error_response(ProxyErrorCode::ConnectionFailed);
        }
    };

    let (status, response_headers) = match parse_upgrade_response(&head) {
        Some(parsed) => parsed,
        None => {
            error!(service, "Failed to parse backend upgrade response");
            return error_response(ProxyErrorCode::ConnectionFailed);
        }
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(service, status = %status, "Backend rejected upgrade request");
        let body = match tokio::time::timeout(
            REJECTED_UPGRADE_BODY_TIMEOUT,
            read_rejected_body(&mut backend_stream, early_data, &response_headers),
        )
        .await
        {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => {
                error!(service, error = %e, "Failed to read rejected upgrade body from backend");
                return error_response(ProxyErrorCode::ConnectionFailed);
            }
            Err(_) => {
                error!(service, "Timed out reading rejected upgrade body from backend");
                return error_response(ProxyErrorCode::ConnectionFailed);
            }
        };
        let mut response = Response::builder().status(status);
        for (name, value) in &response_headers {
            let name_lower = name.to_lowercase();
            if name_lower == "content-length" || name_lower == "transfer-encoding" {
                continue;
            }
            if let Ok(hv) = HeaderValue::from_str(value) {
                response = response.header(name.as_str(), hv);
            }
        }
        return response
            .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
            .unwrap_or_else(|_| error_response(ProxyErrorCode::ConnectionFailed));
    }

    info!(service, request_id, upgrade_type, "Upgrade successful");

    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in &response_headers {
        let name_lower = name.to_lowercase();
        if name_lower == "content-length" || name_lower == "transfer-encoding" {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }

    let response = match response.body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed()) {
        Ok(response) => response,
        Err(e) => {
            error!(service, error = %e, "Backend sent an unusable upgrade response");
            return error_response(ProxyErrorCode::ConnectionFailed);
        }
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                debug!(service, request_id, "Client upgrade complete, starting forwarding");
                forward_bidirectional(upgraded, backend_stream, early_data, &service, &request_id).await;
            }
            Err(e) => {
                error!(service, error = %e, "Failed to upgrade client connection");
            }
        }
    });

    response
}
