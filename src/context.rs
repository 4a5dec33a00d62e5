//! Application state shared by the proxy and admin servers

use crate::config::Config;
use crate::discover::EndpointDiscover;
use crate::proxy::{create_proxy_with_settings, Proxy, ProxyMode};
use crate::registry::MemoryRegistry;
use crate::router::{Route, RouteTable};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{info, warn};

/// Admin view of one configured proxy
#[derive(Debug, Clone, Serialize)]
pub struct ProxyStatus {
    pub name: String,
    pub mode: ProxyMode,
    pub prefix: String,
    pub strip_prefix: bool,
    pub project: Option<String>,
    pub endpoints: Vec<String>,
}

/// Registry, discovery, and the route table, built once at startup
pub struct AppContext {
    pub registry: Arc<MemoryRegistry>,
    pub discover: EndpointDiscover,
    routes: RouteTable,
    /// Discovery project per proxy name
    projects: HashMap<String, String>,
    started: Instant,
}

impl AppContext {
    /// Build every configured proxy and register it with discovery
    ///
    /// Must be called inside a tokio runtime; discovery watches are spawned here.
    pub fn from_config(config: &Config, shutdown: watch::Receiver<bool>) -> Self {
        let registry = Arc::new(MemoryRegistry::new());
        let discover = EndpointDiscover::new(registry.clone(), config.discover.discover_config());
        let mut routes = RouteTable::new();
        let mut projects = HashMap::new();

        for proxy_config in &config.proxies {
            let mode = proxy_config.mode.to_ascii_lowercase();
            if !matches!(mode.as_str(), "http" | "websocket" | "ws") {
                warn!(proxy = %proxy_config.name, mode = %proxy_config.mode, "Unknown proxy mode, using http");
            }

            let proxy = create_proxy_with_settings(
                &proxy_config.name,
                &proxy_config.mode,
                &proxy_config.endpoints,
                config.server.proxy_settings(Some(shutdown.clone())),
            );
            info!(
                proxy = %proxy.name(),
                mode = %proxy.mode(),
                prefix = %proxy_config.prefix,
                endpoints = ?proxy_config.endpoints,
                "Proxy configured"
            );

            if let Some(project) = proxy_config.project() {
                discover.add_project(project, proxy.clone());
                projects.insert(proxy_config.name.clone(), project.to_string());
            }

            routes.add(Route::new(&proxy_config.prefix, proxy_config.strip_prefix, proxy));
        }

        Self {
            registry,
            discover,
            routes,
            projects,
            started: Instant::now(),
        }
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Proxy configured under `name`
    pub fn proxy(&self, name: &str) -> Option<Arc<dyn Proxy>> {
        self.routes
            .routes()
            .iter()
            .find(|r| r.proxy.name() == name)
            .map(|r| r.proxy.clone())
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Status of every proxy, longest prefix first
    pub fn proxies(&self) -> Vec<ProxyStatus> {
        self.routes
            .routes()
            .iter()
            .map(|route| ProxyStatus {
                name: route.proxy.name().to_string(),
                mode: route.proxy.mode(),
                prefix: route.prefix.clone(),
                strip_prefix: route.strip_prefix,
                project: self.projects.get(route.proxy.name()).cloned(),
                endpoints: route.proxy.endpoints().to_strings(),
            })
            .collect()
    }

    /// Stop discovery; proxies keep serving their last endpoints
    pub fn shutdown(&self) {
        self.discover.stop();
    }
}
