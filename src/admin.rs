use crate::context::AppContext;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the proxy
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// Admin API: health, discovery status, and registry writes
pub struct AdminServer {
    bind_addr: SocketAddr,
    context: Arc<AppContext>,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Arc<String>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        context: Arc<AppContext>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            context,
            shutdown_rx,
            auth_token: Arc::new(auth_token),
        }
    }

    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Admin API server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let auth_token = Arc::clone(&self.auth_token);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let context = Arc::clone(&self.context);
                            let auth_token = Arc::clone(&auth_token);

                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, context, auth_token).await {
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

async fn serve_admin_connection<S>(
    stream: S,
    context: Arc<AppContext>,
    auth_token: Arc<String>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let context = Arc::clone(&context);
        let token = Arc::clone(&auth_token);
        async move { handle_admin_request(req, context, token).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth(req: &Request<Incoming>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| {
            // Support "Bearer <token>" format
            auth.strip_prefix("Bearer ")
                .unwrap_or(auth)
                .eq(expected_token)
        })
        .unwrap_or(false)
}

/// Split `/registry/{project}/servers[/{server}]` into its names
fn registry_path(path: &str) -> Option<(&str, Option<&str>)> {
    let rest = path.strip_prefix("/registry/")?;
    let mut segments = rest.split('/');
    let project = segments.next().filter(|s| !s.is_empty())?;
    if segments.next()? != "servers" {
        return None;
    }
    let server = match segments.next() {
        None => None,
        Some(server) if !server.is_empty() => Some(server),
        Some(_) => return None,
    };
    if segments.next().is_some() {
        return None;
    }
    Some((project, server))
}

async fn handle_admin_request(
    req: Request<Incoming>,
    context: Arc<AppContext>,
    auth_token: Arc<String>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    debug!(%method, %path, "Admin API request");

    let is_public = method == Method::GET && matches!(path.as_str(), "/health" | "/version");
    if !is_public && !check_auth(&req, &auth_token) {
        warn!(%path, "Unauthorized admin API request");
        return Ok(response(StatusCode::UNAUTHORIZED, "unauthorized"));
    }

    let response = match (&method, path.as_str()) {
        // Health check for the admin API itself (no auth required)
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        // Version endpoint: GET /version (no auth required)
        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
                "uptime_secs": context.uptime_secs(),
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        // Discovery projects with watch failures: GET /projects
        (&Method::GET, "/projects") => {
            let projects = context.discover.projects();
            let body = serde_json::json!({
                "count": projects.len(),
                "projects": projects,
            });
            json_response(StatusCode::OK, body.to_string())
        }

        // Configured proxies and their current endpoints: GET /proxies
        (&Method::GET, "/proxies") => {
            let proxies = context.proxies();
            let body = serde_json::json!({
                "count": proxies.len(),
                "proxies": proxies,
            });
            json_response(StatusCode::OK, body.to_string())
        }

        // Stop watching a project: DELETE /projects/{name}
        (&Method::DELETE, path) if path.starts_with("/projects/") => {
            let name = path.strip_prefix("/projects/").unwrap_or("");
            if name.is_empty() {
                response(StatusCode::BAD_REQUEST, "missing project")
            } else if context.discover.remove(name) {
                info!(project = name, "Project removed via admin API");
                response(StatusCode::OK, "ok")
            } else {
                response(StatusCode::NOT_FOUND, "project not found")
            }
        }

        (_, path) if path.starts_with("/registry/") => match registry_path(path) {
            // List servers: GET /registry/{project}/servers
            Some((project, None)) if method == Method::GET => {
                let servers = context.registry.servers(project);
                json_response(StatusCode::OK, serde_json::json!({ "servers": servers }).to_string())
            }

            // Register a server, body is its url: PUT /registry/{project}/servers/{server}
            Some((project, Some(server))) if method == Method::PUT => {
                let (project, server) = (project.to_string(), server.to_string());
                let body = req.into_body().collect().await?.to_bytes();
                let url = String::from_utf8_lossy(&body).trim().to_string();
                if url.is_empty() {
                    response(StatusCode::BAD_REQUEST, "missing url")
                } else {
                    context.registry.put_server(&project, &server, &url);
                    response(StatusCode::OK, "ok")
                }
            }

            // Deregister a server: DELETE /registry/{project}/servers/{server}
            Some((project, Some(server))) if method == Method::DELETE => {
                if context.registry.delete_server(project, server) {
                    response(StatusCode::OK, "ok")
                } else {
                    response(StatusCode::NOT_FOUND, "server not found")
                }
            }

            Some(_) => response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
            None => response(StatusCode::NOT_FOUND, "not found"),
        },

        // 404 for everything else
        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_path() {
        assert_eq!(
            registry_path("/registry/builder/servers/b1"),
            Some(("builder", Some("b1")))
        );
        assert_eq!(registry_path("/registry/builder/servers"), Some(("builder", None)));
        assert_eq!(registry_path("/registry/builder/servers/"), None);
        assert_eq!(registry_path("/registry//servers/b1"), None);
        assert_eq!(registry_path("/registry/builder/nodes/b1"), None);
        assert_eq!(registry_path("/registry/builder/servers/b1/extra"), None);
    }
}
