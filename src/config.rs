use crate::backoff::ExponentialBackoff;
use crate::discover::DiscoverConfig;
use crate::pool::PoolConfig;
use crate::proxy::ProxySettings;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tokio::sync::watch;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Retry policy for registry watches
    #[serde(default)]
    pub discover: DiscoverSection,

    /// Proxies and the routes they serve
    #[serde(default)]
    pub proxies: Vec<ProxyConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Proxy listen port (default: 8888)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Port for the admin API
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Authentication token for admin API (required for write operations)
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Maximum idle connections per backend host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Upstream HTTP response timeout in seconds (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// WebSocket backend dial timeout in seconds (default: 10)
    #[serde(default = "default_websocket_connect_timeout")]
    pub websocket_connect_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            admin_port: default_admin_port(),
            admin_token: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
            websocket_connect_timeout_secs: default_websocket_connect_timeout(),
        }
    }
}

impl ServerConfig {
    /// Transport settings for every proxy built from this config
    pub fn proxy_settings(&self, shutdown: Option<watch::Receiver<bool>>) -> ProxySettings {
        ProxySettings {
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            connect_timeout: Duration::from_secs(self.websocket_connect_timeout_secs),
            pool: PoolConfig {
                max_idle_per_host: self.pool_max_idle_per_host,
                idle_timeout: Duration::from_secs(self.pool_idle_timeout_secs),
            },
            shutdown,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiscoverSection {
    /// Consecutive watch failures before a project is dropped (default: 5)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_min_backoff")]
    pub min_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    #[serde(default = "default_jitter")]
    pub jitter_ms: u64,
}

impl Default for DiscoverSection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            min_backoff_ms: default_min_backoff(),
            max_backoff_ms: default_max_backoff(),
            backoff_factor: default_backoff_factor(),
            jitter_ms: default_jitter(),
        }
    }
}

impl DiscoverSection {
    pub fn discover_config(&self) -> DiscoverConfig {
        DiscoverConfig {
            max_retries: self.max_retries,
            backoff: ExponentialBackoff::new(
                Duration::from_millis(self.min_backoff_ms),
                Duration::from_millis(self.max_backoff_ms),
                self.backoff_factor,
                Duration::from_millis(self.jitter_ms),
            ),
        }
    }
}

/// One proxy: its transport, initial endpoints, discovery project and route
#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    pub name: String,

    /// Transport: "http" or "websocket" (default: http)
    #[serde(default = "default_mode")]
    pub mode: String,

    /// Initial endpoints, `address` or `label=>address`
    #[serde(default)]
    pub endpoints: Vec<String>,

    /// Discovery project; defaults to the proxy name, empty disables discovery
    pub project: Option<String>,

    /// Route prefix served by this proxy (default: /)
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Remove the prefix from the path before forwarding
    #[serde(default)]
    pub strip_prefix: bool,
}

impl ProxyConfig {
    pub fn new(name: &str, mode: &str, endpoints: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            mode: mode.to_string(),
            endpoints: endpoints.iter().map(|e| e.to_string()).collect(),
            project: None,
            prefix: default_prefix(),
            strip_prefix: false,
        }
    }

    pub fn with_prefix(mut self, prefix: &str, strip: bool) -> Self {
        self.prefix = prefix.to_string();
        self.strip_prefix = strip;
        self
    }

    pub fn with_project(mut self, project: &str) -> Self {
        self.project = Some(project.to_string());
        self
    }

    /// Discovery project for this proxy, `None` when discovery is disabled
    pub fn project(&self) -> Option<&str> {
        match self.project.as_deref() {
            Some("") => None,
            Some(project) => Some(project),
            None => Some(&self.name),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("Proxy name must not be empty".to_string());
        }
        if !self.prefix.starts_with('/') {
            return Err(format!(
                "Proxy '{}': prefix '{}' must start with '/'",
                self.name, self.prefix
            ));
        }
        Ok(())
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8888
}

fn default_admin_port() -> u16 {
    9999
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_request_timeout() -> u64 {
    30
}

fn default_websocket_connect_timeout() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    5
}

fn default_min_backoff() -> u64 {
    500
}

fn default_max_backoff() -> u64 {
    30_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_jitter() -> u64 {
    250
}

fn default_mode() -> String {
    "http".to_string()
}

fn default_prefix() -> String {
    "/".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();
        let mut names = HashSet::new();

        for proxy in &self.proxies {
            if let Err(e) = proxy.validate() {
                errors.push(e);
            }
            if !names.insert(proxy.name.as_str()) {
                errors.push(format!("Proxy '{}' is defined more than once", proxy.name));
            }
        }

        let discover = &self.discover;
        if discover.min_backoff_ms > discover.max_backoff_ms {
            errors.push(format!(
                "discover: min_backoff_ms ({}) exceeds max_backoff_ms ({})",
                discover.min_backoff_ms, discover.max_backoff_ms
            ));
        }
        if discover.backoff_factor.is_nan() || discover.backoff_factor < 1.0 {
            errors.push(format!(
                "discover: backoff_factor ({}) must be at least 1.0",
                discover.backoff_factor
            ));
        }

        if self.server.request_timeout_secs == 0 {
            errors.push("server: request_timeout_secs must be greater than 0".to_string());
        }
        if self.server.websocket_connect_timeout_secs == 0 {
            errors.push("server: websocket_connect_timeout_secs must be greater than 0".to_string());
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
    use std::io::Write;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 8080
bind = "127.0.0.1"
admin_port = 9000
request_timeout_secs = 15

[discover]
max_retries = 3
min_backoff_ms = 100

[[proxies]]
name = "acp_node"
endpoints = ["127.0.0.1:6100"]
prefix = "/v2/nodes"

[[proxies]]
name = "acp_webcli"
mode = "websocket"
endpoints = ["webcli=>127.0.0.1:7171"]
prefix = "/docker_console"

[[proxies]]
name = "dashboard"
endpoints = ["127.0.0.1:9090"]
project = ""
prefix = "/k8s"
strip_prefix = true
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.request_timeout_secs, 15);
        assert_eq!(config.discover.max_retries, 3);
        assert_eq!(config.discover.max_backoff_ms, 30_000);
        assert_eq!(config.proxies.len(), 3);

        assert_eq!(config.proxies[0].mode, "http");
        assert_eq!(config.proxies[0].project(), Some("acp_node"));
        assert_eq!(config.proxies[1].mode, "websocket");
        assert_eq!(config.proxies[2].project(), None);
        assert!(config.proxies[2].strip_prefix);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_server_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8888);
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.admin_port, 9999);
        assert_eq!(config.pool_max_idle_per_host, 10);
        assert_eq!(config.pool_idle_timeout_secs, 90);
        assert_eq!(config.websocket_connect_timeout_secs, 10);
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.server.port, 8888);
        assert_eq!(config.discover.max_retries, 5);
        assert!(config.proxies.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_explicit_project() {
        let proxy = ProxyConfig::new("node_ws", "websocket", &[]).with_project("acp_node");
        assert_eq!(proxy.project(), Some("acp_node"));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let config = Config {
            proxies: vec![
                ProxyConfig::new("builder", "http", &["10.0.0.1:3333"]),
                ProxyConfig::new("builder", "http", &["10.0.0.2:3333"]),
            ],
            ..Default::default()
        };

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("defined more than once"));
    }

    #[test]
    fn test_invalid_prefix_and_name() {
        let config = Config {
            proxies: vec![
                ProxyConfig::new("builder", "http", &[]).with_prefix("builder", false),
                ProxyConfig::new(" ", "http", &[]),
            ],
            ..Default::default()
        };

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("must start with '/'"));
        assert!(err.contains("must not be empty"));
    }

    #[test]
    fn test_invalid_backoff_rejected() {
        let mut config = Config::default();
        config.discover.min_backoff_ms = 5_000;
        config.discover.max_backoff_ms = 1_000;
        config.discover.backoff_factor = 0.5;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("exceeds max_backoff_ms"));
        assert!(err.contains("at least 1.0"));
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let mut config = Config::default();
        config.server.request_timeout_secs = 0;
        config.server.websocket_connect_timeout_secs = 0;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("request_timeout_secs"));
        assert!(err.contains("websocket_connect_timeout_secs"));
    }

    #[test]
    fn test_proxy_settings_from_server() {
        let server = ServerConfig {
            request_timeout_secs: 5,
            websocket_connect_timeout_secs: 2,
            pool_max_idle_per_host: 3,
            ..Default::default()
        };

        let settings = server.proxy_settings(None);
        assert_eq!(settings.request_timeout, Duration::from_secs(5));
        assert_eq!(settings.connect_timeout, Duration::from_secs(2));
        assert_eq!(settings.pool.max_idle_per_host, 3);
        assert!(settings.shutdown.is_none());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[[proxies]]
name = "builder"
endpoints = ["10.0.0.1:3333"]
prefix = "/builder"
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.proxies[0].name, "builder");
        assert_eq!(config.proxies[0].prefix, "/builder");
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[[proxies]]\nname = \"a\"\nprefix = \"nope\"").unwrap();

        assert!(Config::load(file.path()).is_err());
    }
}
