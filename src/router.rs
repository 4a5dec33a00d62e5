//! Path-prefix routing from inbound requests to proxies

use crate::proxy::Proxy;
use hyper::Uri;
use std::sync::Arc;

/// A prefix served by one proxy
#[derive(Clone)]
pub struct Route {
    pub prefix: String,
    /// Remove the prefix from the path before forwarding
    pub strip_prefix: bool,
    pub proxy: Arc<dyn Proxy>,
}

impl Route {
    pub fn new(prefix: &str, strip_prefix: bool, proxy: Arc<dyn Proxy>) -> Self {
        Self {
            prefix: prefix.to_string(),
            strip_prefix,
            proxy,
        }
    }

    /// The URI to forward for `uri`, with the prefix removed when stripping is on
    pub fn rewrite(&self, uri: &Uri) -> Uri {
        if !self.strip_prefix || self.prefix == "/" {
            return uri.clone();
        }

        let rest = uri
            .path()
            .strip_prefix(self.prefix.trim_end_matches('/'))
            .unwrap_or(uri.path());
        let path = if rest.starts_with('/') {
            rest.to_string()
        } else {
            format!("/{}", rest)
        };
        let path_and_query = match uri.query() {
            Some(query) => format!("{}?{}", path, query),
            None => path,
        };

        let mut parts = uri.clone().into_parts();
        match path_and_query.parse() {
            Ok(pq) => {
                parts.path_and_query = Some(pq);
                Uri::from_parts(parts).unwrap_or_else(|_| uri.clone())
            }
            Err(_) => uri.clone(),
        }
    }
}

/// Routes ordered so the longest matching prefix wins
#[derive(Clone, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, route: Route) {
        self.routes.push(route);
        self.routes
            .sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
    }

    /// The route with the longest prefix matching `path`
    pub fn find(&self, path: &str) -> Option<&Route> {
        self.routes.iter().find(|r| prefix_matches(&r.prefix, path))
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Prefix match on segment boundaries: `/api` matches `/api` and `/api/x`, not `/apikeys`
fn prefix_matches(prefix: &str, path: &str) -> bool {
    if path == prefix || prefix == "/" {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => prefix.ends_with('/') || rest.starts_with('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::create_proxy;

    fn table() -> RouteTable {
        let mut table = RouteTable::new();
        table.add(Route::new("/", false, create_proxy("default", "http", &["127.0.0.1:1"])));
        table.add(Route::new("/v2/nodes", false, create_proxy("acp_node", "http", &["127.0.0.1:2"])));
        table.add(Route::new("/v2", false, create_proxy("api", "http", &["127.0.0.1:3"])));
        table.add(Route::new("/k8s/", true, create_proxy("dashboard", "http", &["127.0.0.1:4"])));
        table
    }

    #[tokio::test]
    async fn test_longest_prefix_wins() {
        let table = table();

        assert_eq!(table.find("/v2/nodes/abc").unwrap().proxy.name(), "acp_node");
        assert_eq!(table.find("/v2/nodes").unwrap().proxy.name(), "acp_node");
        assert_eq!(table.find("/v2/tenants").unwrap().proxy.name(), "api");
        assert_eq!(table.find("/v2nodes").unwrap().proxy.name(), "default");
        assert_eq!(table.find("/other").unwrap().proxy.name(), "default");
    }

    #[tokio::test]
    async fn test_no_match_without_root() {
        let mut table = RouteTable::new();
        table.add(Route::new("/builder", false, create_proxy("builder", "http", &["127.0.0.1:1"])));

        assert!(table.find("/other").is_none());
        assert!(table.find("/builderx").is_none());
        assert!(table.find("/builder/status").is_some());
    }

    #[tokio::test]
    async fn test_strip_prefix_rewrite() {
        let table = table();
        let route = table.find("/k8s/api/v1/pods").unwrap();
        assert_eq!(route.proxy.name(), "dashboard");

        let uri: Uri = "/k8s/api/v1/pods?watch=true".parse().unwrap();
        assert_eq!(route.rewrite(&uri).to_string(), "/api/v1/pods?watch=true");

        let uri: Uri = "/k8s/".parse().unwrap();
        assert_eq!(route.rewrite(&uri).to_string(), "/");
    }

    #[tokio::test]
    async fn test_rewrite_without_strip_keeps_path() {
        let table = table();
        let route = table.find("/v2/nodes/1").unwrap();
        let uri: Uri = "/v2/nodes/1?x=1".parse().unwrap();
        assert_eq!(route.rewrite(&uri), uri);
    }
}
