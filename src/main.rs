use dockgate::admin::{AdminApi, AdminServer, PKG_NAME, VERSION};
use dockgate::config::Config;
use dockgate::docker::DockerManager;
use dockgate::history::EventHistory;
use dockgate::proxy::ProxyServer;
use dockgate::registry::ServiceRegistry;
use dockgate::watcher::EventWatcher;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "dockgate.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("dockgate=debug".parse().expect("valid log directive")),
        )
        .init();

    let config = load_config()?;

    print_startup_banner(&config);

    let bind_ip: IpAddr = config
        .server
        .bind
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address '{}': {}", config.server.bind, e))?;
    let proxy_addr = SocketAddr::new(bind_ip, config.server.proxy_port);
    let admin_addr = SocketAddr::new(bind_ip, config.server.admin_port);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let registry = ServiceRegistry::new();
    let history = EventHistory::new(
        config.events.history_capacity,
        config.events.history_retention(),
    );

    // A daemon that is down at startup is picked up by the watcher's reconnect
    // loop; only an unusable host setting leaves the proxy without Docker
    let docker = match DockerManager::connect(config.docker.host.as_deref()).await {
        Ok(manager) => {
            if let Err(e) = manager.ping().await {
                warn!(error = %e, "Docker daemon not reachable yet; will keep retrying the event feed");
            }
            Some(Arc::new(manager))
        }
        Err(e) => {
            error!(error = %e, "Docker unavailable; container events will not be watched");
            None
        }
    };

    // Bind both listeners before spawning anything so a taken port is fatal
    let proxy_server = ProxyServer::bind(
        proxy_addr,
        Arc::clone(&registry),
        shutdown_rx.clone(),
        &config.proxy,
    )
    .await?;
    let pool_stats = proxy_server.pool().stats();

    let mut admin_api = AdminApi::new(
        Arc::clone(&registry),
        Arc::clone(&history),
        config.server.root_domain.clone(),
    );
    if let Some(docker) = &docker {
        admin_api = admin_api.with_docker(Arc::clone(docker));
    }
    let admin_server = AdminServer::bind(admin_addr, admin_api, shutdown_rx.clone()).await?;

    let watcher_handle = docker.as_ref().map(|docker| {
        let watcher = EventWatcher::new(
            Arc::clone(docker),
            Arc::clone(&registry),
            Arc::clone(&history),
            config.events.clone(),
        );
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { watcher.run(shutdown).await })
    });

    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy_server.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "Admin server error");
        }
    });

    wait_for_shutdown_signal().await;

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Wait for tasks to stop (with timeout)
    let stopped = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = proxy_handle.await;
        let _ = admin_handle.await;
        if let Some(handle) = watcher_handle {
            let _ = handle.await;
        }
    })
    .await;

    if stopped.is_err() {
        warn!("Timed out waiting for tasks to stop");
    }

    info!(
        services = registry.len(),
        proxied_requests = pool_stats.get_total_requests(),
        failed_requests = pool_stats.get_failed_requests(),
        "Shutdown complete"
    );
    Ok(())
}

/// Config path comes from the first argument; a missing default file means defaults
fn load_config() -> anyhow::Result<Config> {
    match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => {
            let config = Config::load(&path).map_err(|e| {
                error!(path = %path.display(), error = %e, "Failed to load configuration");
                e
            })?;
            info!(path = %path.display(), "Configuration loaded");
            Ok(config)
        }
        None => {
            let path = PathBuf::from(DEFAULT_CONFIG_PATH);
            if path.exists() {
                let config = Config::load(&path)?;
                info!(path = %path.display(), "Configuration loaded");
                Ok(config)
            } else {
                info!("No configuration file found, using defaults");
                let config = Config::default();
                config.validate()?;
                Ok(config)
            }
        }
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received SIGINT (Ctrl+C), shutting down...");
                    }
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, shutting down...");
                    }
                }
                return;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler; only Ctrl+C will stop the server");
            }
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C");
        return;
    }
    info!("Received Ctrl+C, shutting down...");
}

fn print_startup_banner(config: &Config) {
    info!(
        name = PKG_NAME,
        version = VERSION,
        "Starting subdomain proxy"
    );
    info!(
        bind = %config.server.bind,
        proxy_port = config.server.proxy_port,
        admin_port = config.server.admin_port,
        root_domain = %config.server.root_domain,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.proxy.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.proxy.pool_idle_timeout_secs,
        connect_timeout_secs = config.proxy.connect_timeout_secs,
        request_timeout_secs = config.proxy.request_timeout_secs,
        "Proxy settings"
    );
    info!(
        docker_host = config.docker.host.as_deref().unwrap_or("auto"),
        history_capacity = config.events.history_capacity,
        reconnect = config.events.reconnect,
        "Event feed settings"
    );
}
