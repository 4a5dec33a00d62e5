//! The proxy contract and the transport factory
//!
//! A [`Proxy`] owns an endpoint list and a selection policy and forwards
//! requests to whichever endpoint the policy picks. Two transports implement
//! it: buffered HTTP ([`HttpProxy`]) and full-duplex WebSocket relay
//! ([`WebSocketProxy`]). [`create_proxy`] is the one place a mode string is
//! mapped to a transport.

use crate::endpoint::{create_endpoints, Endpoint, EndpointList};
use crate::error::{NoUpstream, ProxyError};
use crate::http_proxy::HttpProxy;
use crate::loadbalancer::{LoadBalance, RoundRobin};
use crate::pool::PoolConfig;
use crate::websocket_proxy::WebSocketProxy;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION};
use hyper::{Request, Response};
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Body type flowing through every proxy
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Header name for forwarded-for
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Headers that apply to a single connection and are never forwarded
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Address of the client that sent a request, set by the server as a request extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddr(pub SocketAddr);

/// Transport a proxy speaks to its upstreams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    Http,
    WebSocket,
}

impl ProxyMode {
    /// Parse a mode string; anything unrecognised falls back to HTTP
    pub fn parse(mode: &str) -> Self {
        match mode.trim().to_ascii_lowercase().as_str() {
            "websocket" | "ws" => ProxyMode::WebSocket,
            _ => ProxyMode::Http,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyMode::Http => "http",
            ProxyMode::WebSocket => "websocket",
        }
    }
}

impl fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tunables shared by both transports
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Maximum time to wait for an upstream HTTP response
    pub request_timeout: Duration,
    /// Maximum time to establish an upstream WebSocket connection
    pub connect_timeout: Duration,
    /// Upstream connection pool for the HTTP transport
    pub pool: PoolConfig,
    /// Server shutdown signal; WebSocket relays close both peers when it fires
    pub shutdown: Option<watch::Receiver<bool>>,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            pool: PoolConfig::default(),
            shutdown: None,
        }
    }
}

/// Capability contract shared by every transport
#[async_trait]
pub trait Proxy: Send + Sync {
    /// Name the proxy was created with
    fn name(&self) -> &str;

    fn mode(&self) -> ProxyMode;

    /// Snapshot of the current endpoint list
    fn endpoints(&self) -> Arc<EndpointList>;

    /// Forward `req` to a selected endpoint and produce the client response
    ///
    /// Never fails: transport errors are turned into an error status.
    async fn proxy(&self, req: Request<ProxyBody>) -> Response<ProxyBody>;

    /// Perform `req` against a selected endpoint and hand back the raw response
    async fn send(&self, req: Request<ProxyBody>) -> Result<Response<Incoming>, ProxyError>;

    /// Replace the endpoint list; accepts `label=>address` or bare addresses
    fn update_endpoints(&self, endpoints: &[String]);
}

/// Create a proxy with default settings
pub fn create_proxy<S: AsRef<str>>(name: &str, mode: &str, endpoints: &[S]) -> Arc<dyn Proxy> {
    create_proxy_with_settings(name, mode, endpoints, ProxySettings::default())
}

/// Create a proxy for `mode`; unknown modes fall back to HTTP
pub fn create_proxy_with_settings<S: AsRef<str>>(
    name: &str,
    mode: &str,
    endpoints: &[S],
    settings: ProxySettings,
) -> Arc<dyn Proxy> {
    match ProxyMode::parse(mode) {
        ProxyMode::WebSocket => Arc::new(WebSocketProxy::new(name, endpoints, settings)),
        ProxyMode::Http => Arc::new(HttpProxy::new(name, endpoints, settings)),
    }
}

/// Endpoint list plus selection policy, swappable while requests read it
///
/// Updates build a complete list and swap it in, so a reader sees either the
/// old list or the new one.
#[derive(Debug)]
pub(crate) struct Upstreams {
    endpoints: ArcSwap<EndpointList>,
    lb: Arc<dyn LoadBalance>,
}

impl Upstreams {
    pub(crate) fn new<S: AsRef<str>>(endpoints: &[S], lb: Arc<dyn LoadBalance>) -> Self {
        Self {
            endpoints: ArcSwap::from_pointee(create_endpoints(endpoints)),
            lb,
        }
    }

    pub(crate) fn round_robin<S: AsRef<str>>(endpoints: &[S]) -> Self {
        Self::new(endpoints, Arc::new(RoundRobin::new()))
    }

    pub(crate) fn snapshot(&self) -> Arc<EndpointList> {
        self.endpoints.load_full()
    }

    pub(crate) fn select(&self, req: &Request<ProxyBody>) -> Result<Endpoint, NoUpstream> {
        let endpoints = self.endpoints.load();
        self.lb.select(req, &endpoints)
    }

    pub(crate) fn replace(&self, endpoints: EndpointList) {
        self.endpoints.store(Arc::new(endpoints));
    }
}

/// An empty body
pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// A body holding `bytes`
pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed()
}

/// The client address recorded on the request, if any
pub fn client_addr<B>(req: &Request<B>) -> Option<SocketAddr> {
    req.extensions().get::<ClientAddr>().map(|c| c.0)
}

/// Value for `X-Forwarded-For`: prior values folded into one, then the client IP
pub fn forwarded_for(headers: &HeaderMap, client: Option<SocketAddr>) -> Option<String> {
    let client = client?;
    let prior: Vec<&str> = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();

    if prior.is_empty() {
        Some(client.ip().to_string())
    } else {
        Some(format!("{}, {}", prior.join(", "), client.ip()))
    }
}

/// Remove hop-by-hop headers, including any named in `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// Set `X-Forwarded-For` on `headers` from the client address
pub(crate) fn set_forwarded_for(headers: &mut HeaderMap, client: Option<SocketAddr>) {
    if let Some(value) = forwarded_for(headers, client) {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse() {
        assert_eq!(ProxyMode::parse("http"), ProxyMode::Http);
        assert_eq!(ProxyMode::parse("websocket"), ProxyMode::WebSocket);
        assert_eq!(ProxyMode::parse("WebSocket"), ProxyMode::WebSocket);
        assert_eq!(ProxyMode::parse("ws"), ProxyMode::WebSocket);
        assert_eq!(ProxyMode::parse("grpc"), ProxyMode::Http);
        assert_eq!(ProxyMode::parse(""), ProxyMode::Http);
    }

    #[tokio::test]
    async fn test_factory_dispatch() {
        let http = create_proxy("acp_node", "http", &["127.0.0.1:6100"]);
        assert_eq!(http.mode(), ProxyMode::Http);
        assert_eq!(http.name(), "acp_node");

        let ws = create_proxy("acp_webcli", "websocket", &["127.0.0.1:7171"]);
        assert_eq!(ws.mode(), ProxyMode::WebSocket);

        let fallback = create_proxy("acp_entrance", "unknown", &["127.0.0.1:6200"]);
        assert_eq!(fallback.mode(), ProxyMode::Http);
    }

    #[test]
    fn test_forwarded_for_without_prior() {
        let headers = HeaderMap::new();
        let client: SocketAddr = "10.1.1.1:5555".parse().unwrap();
        assert_eq!(
            forwarded_for(&headers, Some(client)),
            Some("10.1.1.1".to_string())
        );
        assert_eq!(forwarded_for(&headers, None), None);
    }

    #[test]
    fn test_forwarded_for_appends_prior() {
        let mut headers = HeaderMap::new();
        headers.append(X_FORWARDED_FOR, HeaderValue::from_static("1.1.1.1"));
        headers.append(X_FORWARDED_FOR, HeaderValue::from_static("2.2.2.2"));
        let client: SocketAddr = "10.1.1.1:5555".parse().unwrap();

        assert_eq!(
            forwarded_for(&headers, Some(client)),
            Some("1.1.1.1, 2.2.2.2, 10.1.1.1".to_string())
        );
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, x-session"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-session", HeaderValue::from_static("abc"));
        headers.insert("x-request-id", HeaderValue::from_static("42"));

        strip_hop_by_hop(&mut headers);

        assert!(headers.get(CONNECTION).is_none());
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.get("x-session").is_none());
        assert_eq!(headers.get("x-request-id").unwrap(), "42");
    }

    #[test]
    fn test_upstreams_replace_is_whole_list() {
        let upstreams = Upstreams::round_robin(&["10.0.0.1:9000"]);
        upstreams.replace(create_endpoints(&["10.0.0.2:9000"]));

        let snapshot = upstreams.snapshot();
        assert_eq!(snapshot.to_strings(), vec!["10.0.0.2:9000"]);

        let req = Request::new(empty_body());
        assert_eq!(upstreams.select(&req).unwrap().addr(), "10.0.0.2:9000");
    }
}
