//! Buffered HTTP reverse proxy
//!
//! Each request is rewritten by the director to target the selected
//! endpoint and sent through a pooled client; one request in, one response
//! out.

use crate::endpoint::{create_endpoints, Endpoint, EndpointList};
use crate::error::{json_error_response, ProxyError, ProxyErrorCode};
use crate::pool::{ConnectionPool, PoolStats};
use crate::proxy::{
    client_addr, set_forwarded_for, strip_hop_by_hop, Proxy, ProxyBody, ProxyMode, ProxySettings,
    Upstreams,
};
use async_trait::async_trait;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, HOST};
use hyper::http::uri::{PathAndQuery, Scheme};
use hyper::{Request, Response, Uri, Version};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Reverse proxy for plain HTTP upstreams
pub struct HttpProxy {
    name: String,
    upstreams: Upstreams,
    pool: ConnectionPool,
    request_timeout: Duration,
}

impl HttpProxy {
    pub fn new<S: AsRef<str>>(name: &str, endpoints: &[S], settings: ProxySettings) -> Self {
        Self {
            name: name.to_string(),
            upstreams: Upstreams::round_robin(&addresses_only(endpoints)),
            pool: ConnectionPool::new(settings.pool),
            request_timeout: settings.request_timeout,
        }
    }

    /// Statistics of the upstream connection pool
    pub fn pool_stats(&self) -> Arc<PoolStats> {
        self.pool.stats()
    }

    /// Rewrite `req` to target `endpoint`: URI scheme and authority, `Host`,
    /// forwarding headers, and the outbound HTTP version
    fn direct(&self, req: &mut Request<ProxyBody>, endpoint: &Endpoint) -> Result<(), ProxyError> {
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let target = format!("{}{}", endpoint.http_addr().trim_end_matches('/'), path);
        let uri: Uri = target
            .parse()
            .map_err(|e| ProxyError::InvalidRequest(format!("bad upstream uri {}: {}", target, e)))?;

        let host = HeaderValue::from_str(endpoint.authority()).map_err(|e| {
            ProxyError::InvalidRequest(format!("bad upstream host {}: {}", endpoint.authority(), e))
        })?;

        let client = client_addr(req);
        let headers = req.headers_mut();
        strip_hop_by_hop(headers);
        set_forwarded_for(headers, client);
        headers.insert(HOST, host);

        *req.uri_mut() = uri;
        *req.version_mut() = Version::HTTP_11;
        Ok(())
    }

    async fn send_with_timeout(
        &self,
        req: Request<ProxyBody>,
    ) -> Result<Response<Incoming>, ProxyError> {
        match tokio::time::timeout(self.request_timeout, self.pool.send_request(req)).await {
            Ok(result) => result.map_err(ProxyError::from),
            Err(_) => Err(ProxyError::Timeout(self.request_timeout)),
        }
    }
}

#[async_trait]
impl Proxy for HttpProxy {
    fn name(&self) -> &str {
        &self.name
    }

    fn mode(&self) -> ProxyMode {
        ProxyMode::Http
    }

    fn endpoints(&self) -> Arc<EndpointList> {
        self.upstreams.snapshot()
    }

    async fn proxy(&self, mut req: Request<ProxyBody>) -> Response<ProxyBody> {
        let endpoint = match self.upstreams.select(&req) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!(proxy = %self.name, uri = %req.uri(), "No upstream endpoint available");
                return json_error_response(ProxyErrorCode::NoUpstream, e.to_string());
            }
        };

        if let Err(e) = self.direct(&mut req, &endpoint) {
            error!(proxy = %self.name, endpoint = %endpoint, error = %e, "Failed to rewrite request");
            return json_error_response(ProxyErrorCode::InternalError, "Failed to build upstream request");
        }

        debug!(proxy = %self.name, method = %req.method(), uri = %req.uri(), "Proxying request");

        match self.send_with_timeout(req).await {
            Ok(response) => {
                let (mut parts, body) = response.into_parts();
                strip_hop_by_hop(&mut parts.headers);
                Response::from_parts(parts, body.boxed())
            }
            Err(ProxyError::Timeout(timeout)) => {
                warn!(
                    proxy = %self.name,
                    endpoint = %endpoint,
                    timeout_secs = timeout.as_secs(),
                    "Upstream request timed out"
                );
                json_error_response(
                    ProxyErrorCode::RequestTimeout,
                    format!("Request timed out after {} seconds", timeout.as_secs()),
                )
            }
            Err(e) => {
                // Log detailed error internally, return generic message externally
                error!(proxy = %self.name, endpoint = %endpoint, error = %e, "Failed to forward request");
                json_error_response(ProxyErrorCode::ConnectionFailed, "Failed to connect to backend")
            }
        }
    }

    async fn send(&self, mut req: Request<ProxyBody>) -> Result<Response<Incoming>, ProxyError> {
        let endpoint = self.upstreams.select(&req)?;

        let authority = endpoint
            .authority()
            .parse()
            .map_err(|e| ProxyError::InvalidRequest(format!("bad upstream authority: {}", e)))?;
        let mut parts = req.uri().clone().into_parts();
        parts.authority = Some(authority);
        if parts.scheme.is_none() {
            parts.scheme = Some(Scheme::HTTP);
        }
        if parts.path_and_query.is_none() {
            parts.path_and_query = Some(PathAndQuery::from_static("/"));
        }
        *req.uri_mut() = Uri::from_parts(parts)
            .map_err(|e| ProxyError::InvalidRequest(format!("bad upstream uri: {}", e)))?;

        debug!(proxy = %self.name, uri = %req.uri(), "Sending request upstream");
        self.send_with_timeout(req).await
    }

    fn update_endpoints(&self, endpoints: &[String]) {
        let list = create_endpoints(&addresses_only(endpoints));
        info!(proxy = %self.name, endpoints = ?list.to_strings(), "Updated HTTP proxy endpoints");
        self.upstreams.replace(list);
    }
}

/// Keep only the address part of `label=>address` entries
fn addresses_only<S: AsRef<str>>(endpoints: &[S]) -> Vec<String> {
    endpoints
        .iter()
        .map(|e| Endpoint::new(e.as_ref()).addr().to_string())
        .collect()
}
