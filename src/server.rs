//! Public listener of the proxy
//!
//! Accepts connections, tags every request with an `X-Request-ID` and hands
//! it to the proxy whose route prefix matches the path.

use crate::context::AppContext;
use crate::error::{json_error_response, ProxyErrorCode};
use crate::proxy::{ClientAddr, ProxyBody};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";

/// The main reverse proxy server
pub struct ProxyServer {
    bind_addr: SocketAddr,
    context: Arc<AppContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(bind_addr: SocketAddr, context: Arc<AppContext>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            context,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(
            addr = %self.bind_addr,
            routes = self.context.routes().len(),
            "Proxy server listening (HTTP/1.1 and HTTP/2)"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let context = Arc::clone(&self.context);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, context).await {
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

async fn handle_connection<S>(stream: S, addr: SocketAddr, context: Arc<AppContext>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let context = Arc::clone(&context);
        async move { handle_request(req, context, addr).await }
    });

    // HTTP/1.1 connections keep WebSocket upgrades working
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
    req: Request<Incoming>,
    context: Arc<AppContext>,
    client_addr: SocketAddr,
) -> Result<Response<ProxyBody>, hyper::Error> {
    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let route = match context.routes().find(req.uri().path()) {
        Some(route) => route.clone(),
        None => {
            warn!(path = %req.uri().path(), request_id = %request_id, "No route for request");
            let mut response = json_error_response(
                ProxyErrorCode::NoRoute,
                format!("No route for path {}", req.uri().path()),
            );
            set_request_id(&mut response, &request_id);
            return Ok(response);
        }
    };

    let (mut parts, body) = req.into_parts();
    parts.uri = route.rewrite(&parts.uri);
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        parts.headers.insert(X_REQUEST_ID, value);
    }
    parts.extensions.insert(ClientAddr(client_addr));
    let req = Request::from_parts(parts, body.boxed());

    debug!(
        proxy = %route.proxy.name(),
        method = %req.method(),
        uri = %req.uri(),
        request_id = %request_id,
        "Routing request"
    );

    let mut response = route.proxy.proxy(req).await;
    set_request_id(&mut response, &request_id);
    Ok(response)
}

fn set_request_id(response: &mut Response<ProxyBody>, request_id: &str) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(X_REQUEST_ID, value);
    }
}
