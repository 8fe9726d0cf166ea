use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Longest history retention accepted (one year)
pub const MAX_HISTORY_RETENTION_SECS: u64 = 365 * 24 * 60 * 60;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Backend forwarding settings
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Docker daemon connection
    #[serde(default)]
    pub docker: DockerConfig,

    /// Event feed consumption and history
    #[serde(default)]
    pub events: EventsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port the subdomain proxy listens on (default: 80)
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,

    /// Port for the management API (default: 8080)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Domain that service names are published under (default: localhost)
    #[serde(default = "default_root_domain")]
    pub root_domain: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            proxy_port: default_proxy_port(),
            admin_port: default_admin_port(),
            root_domain: default_root_domain(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Maximum idle connections per backend (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Backend connect timeout in seconds (default: 10, 0 disables)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Maximum time to wait for a backend response (default: unlimited)
    pub request_timeout_secs: Option<u64>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: None,
        }
    }
}

impl ProxyConfig {
    pub fn connect_timeout(&self) -> Option<Duration> {
        match self.connect_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DockerConfig {
    /// Docker host URL, e.g. unix:///var/run/docker.sock or tcp://host:2375
    /// (default: DOCKER_HOST, then common socket paths)
    pub host: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EventsConfig {
    /// Maximum number of lifecycle actions kept for statistics (default: 1000)
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// How long lifecycle actions are kept, in seconds (default: 24h)
    #[serde(default = "default_history_retention")]
    pub history_retention_secs: u64,

    /// Resubscribe to the event feed when it ends or fails (default: true)
    #[serde(default = "default_reconnect")]
    pub reconnect: bool,

    /// First reconnect delay in milliseconds, doubled on every failure (default: 500)
    #[serde(default = "default_reconnect_initial")]
    pub reconnect_initial_ms: u64,

    /// Upper bound for the reconnect delay in milliseconds (default: 30000)
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_ms: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
            history_retention_secs: default_history_retention(),
            reconnect: default_reconnect(),
            reconnect_initial_ms: default_reconnect_initial(),
            reconnect_max_ms: default_reconnect_max(),
        }
    }
}

impl EventsConfig {
    pub fn history_retention(&self) -> Duration {
        Duration::from_secs(self.history_retention_secs)
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_proxy_port() -> u16 {
    80
}

fn default_admin_port() -> u16 {
    8080
}

fn default_root_domain() -> String {
    "localhost".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_history_capacity() -> usize {
    1000
}

fn default_history_retention() -> u64 {
    24 * 60 * 60
}

fn default_reconnect() -> bool {
    true
}

fn default_reconnect_initial() -> u64 {
    500
}

fn default_reconnect_max() -> u64 {
    30_000
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.proxy_port != 0 && self.server.proxy_port == self.server.admin_port {
            errors.push(format!(
                "server: proxy_port and admin_port must differ (both {})",
                self.server.proxy_port
            ));
        }

        if self.server.bind.parse::<std::net::IpAddr>().is_err() {
            errors.push(format!("server: invalid bind address '{}'", self.server.bind));
        }

        if self.server.root_domain.trim().is_empty() {
            errors.push("server: 'root_domain' must not be empty".to_string());
        }

        if self.events.history_capacity == 0 {
            errors.push("events: 'history_capacity' must be greater than 0".to_string());
        }

        if self.events.history_retention_secs == 0
            || self.events.history_retention_secs > MAX_HISTORY_RETENTION_SECS
        {
            errors.push(format!(
                "events: 'history_retention_secs' must be between 1 and {} (got {})",
                MAX_HISTORY_RETENTION_SECS, self.events.history_retention_secs
            ));
        }

        if self.events.reconnect_initial_ms == 0 {
            errors.push("events: 'reconnect_initial_ms' must be greater than 0".to_string());
        }

        if self.events.reconnect_initial_ms > self.events.reconnect_max_ms {
            errors.push(format!(
                "events: 'reconnect_initial_ms' ({}) exceeds 'reconnect_max_ms' ({})",
                self.events.reconnect_initial_ms, self.events.reconnect_max_ms
            ));
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
bind = "127.0.0.1"
proxy_port = 8000
admin_port = 9000
root_domain = "dev.test"

[proxy]
pool_max_idle_per_host = 4
connect_timeout_secs = 3
request_timeout_secs = 60

[docker]
host = "unix:///run/user/1000/docker.sock"

[events]
history_capacity = 50
reconnect = false
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.proxy_port, 8000);
        assert_eq!(config.server.admin_port, 9000);
        assert_eq!(config.server.root_domain, "dev.test");
        assert_eq!(config.proxy.pool_max_idle_per_host, 4);
        assert_eq!(config.proxy.connect_timeout(), Some(Duration::from_secs(3)));
        assert_eq!(config.proxy.request_timeout(), Some(Duration::from_secs(60)));
        assert_eq!(
            config.docker.host.as_deref(),
            Some("unix:///run/user/1000/docker.sock")
        );
        assert_eq!(config.events.history_capacity, 50);
        assert!(!config.events.reconnect);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.proxy_port, 80);
        assert_eq!(config.server.admin_port, 8080);
        assert_eq!(config.server.root_domain, "localhost");
        assert_eq!(config.proxy.pool_max_idle_per_host, 10);
        assert_eq!(config.proxy.pool_idle_timeout_secs, 90);
        assert_eq!(config.proxy.connect_timeout(), Some(Duration::from_secs(10)));
        assert!(config.proxy.request_timeout().is_none());
        assert!(config.docker.host.is_none());
        assert_eq!(config.events.history_capacity, 1000);
        assert_eq!(config.events.history_retention(), Duration::from_secs(86400));
        assert!(config.events.reconnect);
        assert_eq!(config.events.reconnect_initial(), Duration::from_millis(500));
        assert_eq!(config.events.reconnect_max(), Duration::from_secs(30));
    }

    #[test]
    fn test_zero_connect_timeout_disables_it() {
        let config: Config = toml::from_str("[proxy]\nconnect_timeout_secs = 0\n").unwrap();
        assert!(config.proxy.connect_timeout().is_none());
    }

    #[test]
    fn test_validate_port_clash() {
        let toml = r#"
[server]
proxy_port = 8080
admin_port = 8080
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("proxy_port and admin_port must differ"));
    }

    #[test]
    fn test_validate_bind_address() {
        let config: Config = toml::from_str("[server]\nbind = \"localhost\"\n").unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("invalid bind address 'localhost'"));

        let config: Config = toml::from_str("[server]\nbind = \"::\"\n").unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_multiple_errors() {
        let toml = r#"
[events]
history_capacity = 0
reconnect_initial_ms = 5000
reconnect_max_ms = 1000
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("'history_capacity' must be greater than 0"));
        assert!(err.contains("exceeds 'reconnect_max_ms'"));
    }

    #[test]
    fn test_validate_history_retention_bounds() {
        let config: Config =
            toml::from_str("[events]\nhistory_retention_secs = 10000000000000\n").unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("'history_retention_secs' must be between 1 and 31536000"));

        let config: Config = toml::from_str("[events]\nhistory_retention_secs = 0\n").unwrap();
        assert!(config.validate().is_err());

        let config: Config = toml::from_str("[events]\nhistory_retention_secs = 31536000\n").unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nproxy_port = 8081\nadmin_port = 8082").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.server.proxy_port, 8081);
        assert_eq!(config.server.admin_port, 8082);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[events]\nhistory_capacity = 0").unwrap();

        assert!(Config::load(file.path()).is_err());
    }
}
