//! Docker daemon access: the event feed and inspection calls used by the
//! watcher, plus the container/image operations behind the management API

use crate::error::FeedError;
use crate::watcher::{ContainerRuntime, RunningContainer};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StatsOptions, StopContainerOptions,
};
use bollard::image::{CreateImageOptions, ListImagesOptions};
use bollard::models::{
    ContainerInspectResponse, ContainerSummary, EventMessage, HostConfig, ImageSummary, Network,
    PortBinding, SystemInfo, VolumeListResponse,
};
use bollard::system::{EventsOptions, Version};
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Seconds Docker waits after SIGTERM before killing a container on stop
const STOP_TIMEOUT_SECS: i64 = 10;

/// Number of log lines returned by the logs endpoint
pub const LOG_TAIL_LINES: usize = 100;

/// Connection to the Docker daemon
pub struct DockerManager {
    client: Docker,
}

/// Wrapper to share DockerManager across tasks
pub type SharedDockerManager = Arc<DockerManager>;

impl DockerManager {
    /// Create a DockerManager for the configured daemon without requiring it
    /// to be up yet; every call dials the daemon on demand
    ///
    /// Connection priority:
    /// 1. Explicit docker_host parameter
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths (platform-specific)
    pub async fn connect(docker_host: Option<&str>) -> anyhow::Result<Self> {
        let client = if let Some(host) = docker_host {
            Self::connect_to_host(host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker at '{}': {}. \
                     Ensure the socket path is correct.",
                    host, e
                )
            })?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker via DOCKER_HOST='{}': {}.",
                    host, e
                )
            })?
        } else {
            Self::connect_with_defaults().await?
        };

        Ok(Self { client })
    }

    /// Check that the daemon is answering
    pub async fn ping(&self) -> anyhow::Result<()> {
        self.client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. \
                 Ensure Docker Desktop, Colima, or dockerd is running.",
                e
            )
        })?;
        debug!("Connected to Docker daemon");
        Ok(())
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if let Some(socket_path) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    async fn connect_with_defaults() -> anyhow::Result<Docker> {
        let home = std::env::var("HOME").unwrap_or_default();
        let xdg_runtime = std::env::var("XDG_RUNTIME_DIR").unwrap_or_default();

        let socket_paths: Vec<(&str, String)> = vec![
            ("Linux default", "/var/run/docker.sock".to_string()),
            ("Docker Desktop (macOS)", format!("{}/.docker/run/docker.sock", home)),
            ("Colima (macOS)", format!("{}/.colima/default/docker.sock", home)),
            ("Rancher Desktop", format!("{}/.rd/docker.sock", home)),
            ("Podman (Linux)", format!("{}/podman/podman.sock", xdg_runtime)),
        ];

        let mut tried_paths = Vec::new();

        for (name, path) in &socket_paths {
            if path.is_empty() || path.contains("//") {
                continue; // Skip invalid paths from empty env vars
            }

            if std::path::Path::new(path).exists() {
                debug!(path, name, "Found Docker socket");
                match Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION) {
                    Ok(client) => {
                        if client.ping().await.is_ok() {
                            return Ok(client);
                        }
                        tried_paths.push(format!("{} ({}) - socket exists but daemon not responding", path, name));
                    }
                    Err(e) => {
                        tried_paths.push(format!("{} ({}) - connection failed: {}", path, name, e));
                    }
                }
            }
        }

        match Docker::connect_with_socket_defaults() {
            Ok(client) => Ok(client),
            Err(e) => {
                let tried_info = if tried_paths.is_empty() {
                    "No Docker socket found at common locations".to_string()
                } else {
                    format!("Tried:\n  - {}", tried_paths.join("\n  - "))
                };

                anyhow::bail!(
                    "Cannot connect to Docker daemon. {}\n\n\
                     To fix this:\n\
                     - Start Docker Desktop, Colima, or dockerd\n\
                     - Or set DOCKER_HOST environment variable\n\
                     - Or set [docker] host in the configuration\n\n\
                     Underlying error: {}",
                    tried_info, e
                )
            }
        }
    }

    /// Subscribe to container lifecycle events, starting with those the
    /// daemon recorded at or after `since`
    pub fn container_events(
        &self,
        since: DateTime<Utc>,
    ) -> BoxStream<'static, Result<EventMessage, FeedError>> {
        let options = EventsOptions::<String> {
            // Whole seconds, rounded down, so the replay may start slightly early
            since: Some(since.timestamp().to_string()),
            filters: HashMap::from([("type".to_string(), vec!["container".to_string()])]),
            ..Default::default()
        };

        self.client
            .events(Some(options))
            .map(|item| item.map_err(FeedError::from))
            .boxed()
    }

    pub async fn inspect_container(&self, id: &str) -> anyhow::Result<ContainerInspectResponse> {
        self.client
            .inspect_container(id, None)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to inspect container '{}': {}", id, e))
    }

    /// List containers; `all` includes stopped ones
    pub async fn list_containers(&self, all: bool) -> anyhow::Result<Vec<ContainerSummary>> {
        let options = ListContainersOptions::<String> {
            all,
            ..Default::default()
        };
        Ok(self.client.list_containers(Some(options)).await?)
    }

    pub async fn list_images(&self) -> anyhow::Result<Vec<ImageSummary>> {
        let options = ListImagesOptions::<String> {
            all: true,
            ..Default::default()
        };
        Ok(self.client.list_images(Some(options)).await?)
    }

    /// Check whether an image reference is present locally
    pub async fn image_exists(&self, image: &str) -> bool {
        self.client.inspect_image(image).await.is_ok()
    }

    /// Pull an image, surfacing registry errors with actionable messages
    pub async fn pull_image(&self, image: &str) -> anyhow::Result<()> {
        info!(image, "Pulling Docker image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, None);
        let mut last_error = None;

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(image, status, "Pull progress");
                    }
                    if let Some(error) = info.error {
                        last_error = Some(error);
                    }
                }
                Err(e) => {
                    let err_str = e.to_string();
                    if err_str.contains("manifest unknown") || err_str.contains("not found") {
                        anyhow::bail!(
                            "Image '{}' not found in registry. \
                             Check the image name and tag are correct.",
                            image
                        );
                    } else if err_str.contains("unauthorized") || err_str.contains("authentication") {
                        anyhow::bail!(
                            "Authentication required to pull '{}'. \
                             Run 'docker login' first or check your credentials.",
                            image
                        );
                    } else {
                        anyhow::bail!("Failed to pull image '{}': {}", image, e);
                    }
                }
            }
        }

        if let Some(error) = last_error {
            anyhow::bail!("Failed to pull image '{}': {}", image, error);
        }

        info!(image, "Image pulled successfully");
        Ok(())
    }

    /// Pull if needed, then create and start a self-removing container.
    ///
    /// Returns the container id. The new container becomes routable through
    /// the regular `start` event like any other container.
    pub async fn create_service(&self, spec: &ContainerSpec) -> anyhow::Result<String> {
        spec.validate()?;
        let image = spec.image_ref();

        if !self.image_exists(&image).await {
            self.pull_image(&image).await?;
        }

        let ports = spec.port_numbers()?;
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        for port in &ports {
            let key = format!("{}/tcp", port);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(port.to_string()),
                }]),
            );
        }

        let container_config = Config {
            image: Some(image.clone()),
            env: Some(spec.env.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                auto_remove: Some(true),
                port_bindings: Some(port_bindings),
                ..Default::default()
            }),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(create_options), container_config)
            .await
            .map_err(|e| {
                let err_str = e.to_string();
                if err_str.contains("Conflict") {
                    anyhow::anyhow!("Container name '{}' is already in use", spec.name)
                } else {
                    anyhow::anyhow!(
                        "Failed to create container '{}' from image '{}': {}",
                        spec.name, image, e
                    )
                }
            })?;

        let container_id = response.id;
        info!(container_id, name = %spec.name, image, "Created Docker container");

        self.client
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| {
                let err_str = e.to_string();
                if err_str.contains("port is already allocated") || err_str.contains("address already in use") {
                    anyhow::anyhow!(
                        "Cannot start container '{}': a requested host port is already in use",
                        spec.name
                    )
                } else {
                    anyhow::anyhow!(
                        "Failed to start container '{}' (id: {}): {}",
                        spec.name, container_id, e
                    )
                }
            })?;

        info!(container_id, name = %spec.name, "Started Docker container");
        Ok(container_id)
    }

    /// Stop a container gracefully, then remove it
    pub async fn remove_container(&self, container_id: &str) -> anyhow::Result<()> {
        let options = StopContainerOptions {
            t: STOP_TIMEOUT_SECS,
        };

        match self.client.stop_container(container_id, Some(options)).await {
            Ok(_) => info!(container_id, "Stopped Docker container"),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => debug!(container_id, "Container was already stopped"),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                anyhow::bail!("No such container: {}", container_id);
            }
            Err(e) => anyhow::bail!("Failed to stop container '{}': {}", container_id, e),
        }

        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.client.remove_container(container_id, Some(options)).await {
            Ok(_) => {
                info!(container_id, "Removed Docker container");
                Ok(())
            }
            // Auto-removed containers are already gone once stopped
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404 | 409, ..
            }) => {
                debug!(container_id, "Container already removed");
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("Failed to remove container '{}': {}", container_id, e)),
        }
    }

    /// Last `LOG_TAIL_LINES` lines of stdout and stderr
    pub async fn container_logs(&self, container_id: &str) -> anyhow::Result<String> {
        let options = LogsOptions::<String> {
            follow: false,
            stdout: true,
            stderr: true,
            timestamps: false,
            tail: LOG_TAIL_LINES.to_string(),
            ..Default::default()
        };

        let mut log_stream = self.client.logs(container_id, Some(options));
        let mut output = String::new();

        while let Some(item) = log_stream.next().await {
            let message = match item? {
                LogOutput::StdOut { message }
                | LogOutput::StdErr { message }
                | LogOutput::Console { message } => message,
                LogOutput::StdIn { .. } => continue,
            };
            output.push_str(&String::from_utf8_lossy(&message));
        }

        Ok(output)
    }

    /// A single resource-usage sample
    pub async fn container_stats(&self, container_id: &str) -> anyhow::Result<serde_json::Value> {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };

        let mut stream = self.client.stats(container_id, Some(options));
        match stream.next().await {
            Some(Ok(stats)) => Ok(serde_json::to_value(stats)?),
            Some(Err(e)) => Err(anyhow::anyhow!("Failed to fetch stats for '{}': {}", container_id, e)),
            None => anyhow::bail!("No stats returned for '{}'", container_id),
        }
    }

    pub async fn remove_image(&self, image_id: &str) -> anyhow::Result<()> {
        self.client
            .remove_image(image_id, None, None)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to remove image '{}': {}", image_id, e))?;
        info!(image_id, "Removed Docker image");
        Ok(())
    }

    pub async fn system_info(&self) -> anyhow::Result<(SystemInfo, Version)> {
        let info = self.client.info().await?;
        let version = self.client.version().await?;
        Ok((info, version))
    }

    pub async fn list_volumes(&self) -> anyhow::Result<VolumeListResponse> {
        Ok(self.client.list_volumes::<String>(None).await?)
    }

    pub async fn list_networks(&self) -> anyhow::Result<Vec<Network>> {
        Ok(self.client.list_networks::<String>(None).await?)
    }
}

#[async_trait]
impl ContainerRuntime for DockerManager {
    fn subscribe(&self, since: DateTime<Utc>) -> BoxStream<'static, Result<EventMessage, FeedError>> {
        self.container_events(since)
    }

    async fn inspect(&self, id: &str) -> anyhow::Result<ContainerInspectResponse> {
        self.inspect_container(id).await
    }

    async fn list_running(&self) -> anyhow::Result<Vec<RunningContainer>> {
        let containers = self.list_containers(false).await?;
        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                let name = c
                    .names
                    .as_ref()
                    .and_then(|names| names.first())
                    .map(|n| n.trim_start_matches('/').to_string());
                Some(RunningContainer { id, name })
            })
            .collect())
    }
}

/// A port given either as a number or as a string, e.g. `8080` or `"8080"`
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PortValue {
    Number(u16),
    Text(String),
}

/// Request to run a new service container
#[derive(Debug, Clone, Deserialize)]
pub struct ContainerSpec {
    pub image: String,
    #[serde(default = "default_tag")]
    pub tag: String,
    pub name: String,
    /// Environment in `KEY=value` form
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub ports: Vec<PortValue>,
}

fn default_tag() -> String {
    "latest".to_string()
}

impl ContainerSpec {
    pub fn image_ref(&self) -> String {
        format!("{}:{}", self.image, self.tag)
    }

    /// Docker container names: `[a-zA-Z0-9][a-zA-Z0-9_.-]*`
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.image.trim().is_empty() {
            anyhow::bail!("'image' must not be empty");
        }
        if self.tag.trim().is_empty() {
            anyhow::bail!("'tag' must not be empty");
        }

        let mut chars = self.name.chars();
        let valid = match chars.next() {
            Some(first) => {
                first.is_ascii_alphanumeric()
                    && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
            }
            None => false,
        };
        if !valid {
            anyhow::bail!("Invalid container name '{}'", self.name);
        }
        if self.name.contains('.') {
            warn!(name = %self.name, "Container names with dots cannot be reached as a single subdomain label");
        }

        self.port_numbers().map(|_| ())
    }

    pub fn port_numbers(&self) -> anyhow::Result<Vec<u16>> {
        self.ports
            .iter()
            .map(|p| {
                let port = match p {
                    PortValue::Number(n) => *n,
                    PortValue::Text(s) => s
                        .trim()
                        .parse::<u16>()
                        .map_err(|_| anyhow::anyhow!("Invalid port '{}'", s))?,
                };
                if port == 0 {
                    anyhow::bail!("Port must be greater than 0");
                }
                Ok(port)
            })
            .collect()
    }
}
