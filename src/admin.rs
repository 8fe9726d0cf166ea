//! Management API: registry and event introspection plus container
//! lifecycle commands backed by the Docker daemon

use crate::docker::{ContainerSpec, SharedDockerManager};
use crate::history::SharedHistory;
use crate::registry::SharedRegistry;
use chrono::{DateTime, Utc};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::{
    HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE,
};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the proxy
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Largest accepted request body
pub const MAX_BODY_BYTES: usize = 64 * 1024;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

fn json_value(status: StatusCode, value: serde_json::Value) -> Response<Full<Bytes>> {
    json_response(status, value.to_string())
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    json_value(status, serde_json::json!({ "error": message.into() }))
}

fn docker_unavailable() -> Response<Full<Bytes>> {
    json_error(StatusCode::SERVICE_UNAVAILABLE, "Docker is not available")
}

/// Shared state behind the management API
pub struct AdminApi {
    registry: SharedRegistry,
    history: SharedHistory,
    docker: Option<SharedDockerManager>,
    root_domain: String,
    started_at: Instant,
}

impl AdminApi {
    pub fn new(registry: SharedRegistry, history: SharedHistory, root_domain: impl Into<String>) -> Self {
        Self {
            registry,
            history,
            docker: None,
            root_domain: root_domain.into(),
            started_at: Instant::now(),
        }
    }

    /// Enable the Docker-backed routes
    pub fn with_docker(mut self, docker: SharedDockerManager) -> Self {
        self.docker = Some(docker);
        self
    }

    pub fn docker_enabled(&self) -> bool {
        self.docker.is_some()
    }

    /// Handle one request; never fails, errors become JSON responses
    pub async fn handle<B>(self: Arc<Self>, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body,
        B::Error: Into<BoxError>,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        debug!(%method, %path, "Admin API request");

        let mut response = if method == Method::OPTIONS {
            let mut preflight = response(StatusCode::NO_CONTENT, Bytes::new());
            let headers = preflight.headers_mut();
            headers.insert(
                ACCESS_CONTROL_ALLOW_METHODS,
                HeaderValue::from_static("GET, POST, DELETE, OPTIONS"),
            );
            headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("Content-Type"));
            preflight
        } else {
            self.route(req, &method, &path).await.unwrap_or_else(|e| {
                error!(%method, %path, error = %e, "Admin API error");
                json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            })
        };

        response
            .headers_mut()
            .insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
        response
    }

    async fn route<B>(&self, req: Request<B>, method: &Method, path: &str) -> anyhow::Result<Response<Full<Bytes>>>
    where
        B: Body,
        B::Error: Into<BoxError>,
    {
        match (method, path) {
            (&Method::GET, "/health") => Ok(response(StatusCode::OK, "ok")),

            (&Method::GET, "/version") => Ok(json_value(
                StatusCode::OK,
                serde_json::json!({
                    "name": PKG_NAME,
                    "version": VERSION,
                }),
            )),

            (&Method::GET, "/api/services") => {
                let services = self.registry.snapshot();
                Ok(json_value(
                    StatusCode::OK,
                    serde_json::json!({
                        "count": services.len(),
                        "services": services,
                    }),
                ))
            }

            (&Method::GET, "/api/events") => {
                let cutoff = match parse_since(req.uri().query()) {
                    Ok(cutoff) => cutoff,
                    Err(message) => return Ok(json_error(StatusCode::BAD_REQUEST, message)),
                };
                let events = match cutoff {
                    Some(cutoff) => self.history.since(cutoff),
                    None => self.history.all(),
                };
                Ok(json_response(StatusCode::OK, serde_json::to_string(&events)?))
            }

            (&Method::GET, "/api/stats") => self.stats().await,

            (&Method::GET, "/api/containers") => {
                let Some(docker) = &self.docker else {
                    return Ok(docker_unavailable());
                };
                let containers: Vec<serde_json::Value> = docker
                    .list_containers(true)
                    .await?
                    .into_iter()
                    .map(|c| {
                        serde_json::json!({
                            "id": c.id,
                            "names": c.names,
                            "image": c.image,
                            "state": c.state,
                            "status": c.status,
                            "ports": c.ports,
                            "created": c.created,
                        })
                    })
                    .collect();
                Ok(json_value(StatusCode::OK, serde_json::Value::Array(containers)))
            }

            (&Method::POST, "/api/containers") => self.create_container(req).await,

            (&Method::DELETE, path) if path.starts_with("/api/containers/") => {
                let id = path.strip_prefix("/api/containers/").unwrap_or("");
                if id.is_empty() || id.contains('/') {
                    return Ok(json_error(StatusCode::NOT_FOUND, "Not found"));
                }
                let Some(docker) = &self.docker else {
                    return Ok(docker_unavailable());
                };
                docker.remove_container(id).await?;
                Ok(json_value(StatusCode::OK, serde_json::json!({ "status": "success" })))
            }

            (&Method::GET, path) if path.starts_with("/api/containers/") && path.ends_with("/logs") => {
                let Some(id) = container_id(path, "/logs") else {
                    return Ok(json_error(StatusCode::NOT_FOUND, "Not found"));
                };
                let Some(docker) = &self.docker else {
                    return Ok(docker_unavailable());
                };
                let logs = docker.container_logs(id).await?;
                Ok(response(StatusCode::OK, logs))
            }

            (&Method::GET, path) if path.starts_with("/api/containers/") && path.ends_with("/stats") => {
                let Some(id) = container_id(path, "/stats") else {
                    return Ok(json_error(StatusCode::NOT_FOUND, "Not found"));
                };
                let Some(docker) = &self.docker else {
                    return Ok(docker_unavailable());
                };
                let stats = docker.container_stats(id).await?;
                Ok(json_value(StatusCode::OK, stats))
            }

            (&Method::GET, "/api/images") => {
                let Some(docker) = &self.docker else {
                    return Ok(docker_unavailable());
                };
                let images: Vec<serde_json::Value> = docker
                    .list_images()
                    .await?
                    .into_iter()
                    .map(|image| {
                        serde_json::json!({
                            "id": image.id,
                            "tags": image.repo_tags,
                            "size": image.size,
                            "created": image.created,
                        })
                    })
                    .collect();
                Ok(json_value(StatusCode::OK, serde_json::Value::Array(images)))
            }

            (&Method::DELETE, path) if path.starts_with("/api/images/") => {
                let id = path.strip_prefix("/api/images/").unwrap_or("");
                if id.is_empty() {
                    return Ok(json_error(StatusCode::NOT_FOUND, "Not found"));
                }
                let Some(docker) = &self.docker else {
                    return Ok(docker_unavailable());
                };
                docker.remove_image(id).await?;
                Ok(json_value(StatusCode::OK, serde_json::json!({ "status": "success" })))
            }

            (&Method::GET, "/api/docker-info") => {
                let Some(docker) = &self.docker else {
                    return Ok(docker_unavailable());
                };
                let (info, version) = docker.system_info().await?;
                Ok(json_value(
                    StatusCode::OK,
                    serde_json::json!({
                        "info": info,
                        "version": version,
                    }),
                ))
            }

            (&Method::GET, "/api/volumes") => {
                let Some(docker) = &self.docker else {
                    return Ok(docker_unavailable());
                };
                let volumes = docker.list_volumes().await?;
                Ok(json_response(StatusCode::OK, serde_json::to_string(&volumes)?))
            }

            (&Method::GET, "/api/networks") => {
                let Some(docker) = &self.docker else {
                    return Ok(docker_unavailable());
                };
                let networks = docker.list_networks().await?;
                Ok(json_response(StatusCode::OK, serde_json::to_string(&networks)?))
            }

            _ => Ok(json_error(StatusCode::NOT_FOUND, "Not found")),
        }
    }

    async fn stats(&self) -> anyhow::Result<Response<Full<Bytes>>> {
        let day_ago = Utc::now() - chrono::Duration::hours(24);

        // Docker counts degrade to null rather than failing the whole report
        let (active_containers, total_images) = match &self.docker {
            Some(docker) => {
                let containers = match docker.list_containers(false).await {
                    Ok(list) => Some(list.len()),
                    Err(e) => {
                        warn!(error = %e, "Failed to count running containers");
                        None
                    }
                };
                let images = match docker.list_images().await {
                    Ok(list) => Some(list.len()),
                    Err(e) => {
                        warn!(error = %e, "Failed to count images");
                        None
                    }
                };
                (containers, images)
            }
            None => (None, None),
        };

        Ok(json_value(
            StatusCode::OK,
            serde_json::json!({
                "activeServices": self.registry.len(),
                "containerEvents": self.history.count_since(day_ago),
                "activeContainers": active_containers,
                "totalImages": total_images,
                "uptime": self.started_at.elapsed().as_secs(),
                "timestamp": Utc::now(),
            }),
        ))
    }

    async fn create_container<B>(&self, req: Request<B>) -> anyhow::Result<Response<Full<Bytes>>>
    where
        B: Body,
        B::Error: Into<BoxError>,
    {
        let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                return Ok(json_error(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large"));
            }
            Err(e) => anyhow::bail!("Failed to read request body: {}", e),
        };

        let spec: ContainerSpec = match serde_json::from_slice(&body) {
            Ok(spec) => spec,
            Err(e) => return Ok(json_error(StatusCode::BAD_REQUEST, format!("Invalid JSON: {}", e))),
        };
        if let Err(e) = spec.validate() {
            return Ok(json_error(StatusCode::BAD_REQUEST, e.to_string()));
        }

        let Some(docker) = &self.docker else {
            return Ok(docker_unavailable());
        };

        let container_id = docker.create_service(&spec).await?;
        info!(name = %spec.name, container_id, "Container created via management API");

        Ok(json_value(
            StatusCode::CREATED,
            serde_json::json!({
                "status": "success",
                "container": format!("{}.{}", spec.name.to_ascii_lowercase(), self.root_domain),
                "containerId": container_id,
            }),
        ))
    }
}

/// The `{id}` of `/api/containers/{id}<suffix>`, if it is a single non-empty segment
fn container_id<'a>(path: &'a str, suffix: &str) -> Option<&'a str> {
    path.strip_prefix("/api/containers/")
        .and_then(|p| p.strip_suffix(suffix))
        .filter(|id| !id.is_empty() && !id.contains('/'))
}

/// Parse `since=<unix millis>` from a query string
fn parse_since(query: Option<&str>) -> Result<Option<DateTime<Utc>>, String> {
    let Some(raw) = query
        .unwrap_or("")
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "since")
        .map(|(_, value)| value)
    else {
        return Ok(None);
    };

    let millis: i64 = raw
        .parse()
        .map_err(|_| format!("Invalid 'since' value '{}': expected unix milliseconds", raw))?;
    DateTime::from_timestamp_millis(millis)
        .map(Some)
        .ok_or_else(|| format!("'since' out of range: {}", millis))
}

/// Management API server
pub struct AdminServer {
    listener: TcpListener,
    api: Arc<AdminApi>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub async fn bind(
        bind_addr: SocketAddr,
        api: AdminApi,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind admin API on {}: {}", bind_addr, e))?;
        Ok(Self {
            listener,
            api: Arc::new(api),
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.listener.local_addr()?;
        info!(addr = %addr, docker = self.api.docker_enabled(), "Admin API server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let api = Arc::clone(&self.api);
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, api).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection<S>(stream: S, api: Arc<AdminApi>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<hyper::body::Incoming>| {
        let api = Arc::clone(&api);
        async move { Ok::<_, hyper::Error>(api.handle(req).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}
