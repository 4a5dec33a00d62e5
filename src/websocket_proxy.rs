//! Full-duplex WebSocket relay
//!
//! The backend is dialed first; the client is only upgraded once the backend
//! handshake succeeded, so a client never holds an open socket with nothing
//! behind it. After the upgrade two relay directions run until either side
//! closes or fails, then both connections are torn down.

use crate::endpoint::{Endpoint, EndpointList};
use crate::error::{json_error_response, ProxyError, ProxyErrorCode};
use crate::proxy::{
    client_addr, empty_body, forwarded_for, Proxy, ProxyBody, ProxyMode, ProxySettings, Upstreams,
    X_FORWARDED_FOR,
};
use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use hyper::body::Incoming;
use hyper::header::{
    HeaderMap, HeaderValue, CONNECTION, COOKIE, HOST, ORIGIN, SEC_WEBSOCKET_ACCEPT,
    SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL, SEC_WEBSOCKET_VERSION, SET_COOKIE, UPGRADE,
};
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// How long the surviving relay direction may keep running after the other ended
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Close reasons are limited to 123 bytes on the wire
const MAX_CLOSE_REASON: usize = 123;

/// Reverse proxy for WebSocket upstreams
pub struct WebSocketProxy {
    name: String,
    upstreams: Upstreams,
    connect_timeout: Duration,
    shutdown: Option<watch::Receiver<bool>>,
}

impl WebSocketProxy {
    pub fn new<S: AsRef<str>>(name: &str, endpoints: &[S], settings: ProxySettings) -> Self {
        Self {
            name: name.to_string(),
            upstreams: Upstreams::round_robin(endpoints),
            connect_timeout: settings.connect_timeout,
            shutdown: settings.shutdown,
        }
    }

    /// Upgrade request for the backend, carrying the client's forwardable headers
    ///
    /// A fresh `Sec-WebSocket-Key` is generated; the client's key only
    /// belongs to the client hop.
    fn backend_request(
        &self,
        req: &Request<ProxyBody>,
        endpoint: &Endpoint,
    ) -> Result<Request<ProxyBody>, hyper::http::Error> {
        // The query string is not forwarded
        let mut backend_req = Request::builder()
            .method(Method::GET)
            .uri(req.uri().path())
            .header(HOST, endpoint.authority())
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, "websocket")
            .header(SEC_WEBSOCKET_VERSION, "13")
            .header(SEC_WEBSOCKET_KEY, generate_key())
            .body(empty_body())?;
        let headers = backend_req.headers_mut();

        if let Some(origin) = req.headers().get(ORIGIN) {
            headers.insert(ORIGIN, origin.clone());
        }
        for protocol in req.headers().get_all(SEC_WEBSOCKET_PROTOCOL) {
            headers.append(SEC_WEBSOCKET_PROTOCOL, protocol.clone());
        }
        for cookie in req.headers().get_all(COOKIE) {
            headers.append(COOKIE, cookie.clone());
        }
        if let Some(value) = forwarded_for(req.headers(), client_addr(req)) {
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(X_FORWARDED_FOR, value);
            }
        }

        Ok(backend_req)
    }
}

#[async_trait]
impl Proxy for WebSocketProxy {
    fn name(&self) -> &str {
        &self.name
    }

    fn mode(&self) -> ProxyMode {
        ProxyMode::WebSocket
    }

    fn endpoints(&self) -> Arc<EndpointList> {
        self.upstreams.snapshot()
    }

    async fn proxy(&self, mut req: Request<ProxyBody>) -> Response<ProxyBody> {
        let Some(client_key) = websocket_key(&req) else {
            warn!(proxy = %self.name, uri = %req.uri(), "Rejected non-WebSocket request");
            return json_error_response(
                ProxyErrorCode::InvalidUpgrade,
                "Expected a WebSocket upgrade request",
            );
        };

        let endpoint = match self.upstreams.select(&req) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!(proxy = %self.name, uri = %req.uri(), "No upstream endpoint available");
                return json_error_response(ProxyErrorCode::NoUpstream, e.to_string());
            }
        };

        let backend_req = match self.backend_request(&req, &endpoint) {
            Ok(backend_req) => backend_req,
            Err(e) => {
                error!(proxy = %self.name, endpoint = %endpoint, error = %e, "Invalid WebSocket backend request");
                return json_error_response(
                    ProxyErrorCode::InternalError,
                    "Failed to build upstream request",
                );
            }
        };
        info!(proxy = %self.name, endpoint = %endpoint, path = %backend_req.uri(), "Connecting to WebSocket backend");

        let dial = dial_backend(endpoint.authority(), backend_req);
        let (backend, backend_headers) = match tokio::time::timeout(self.connect_timeout, dial).await {
            Ok(Ok(connected)) => connected,
            Ok(Err(e)) => {
                error!(proxy = %self.name, endpoint = %endpoint, error = %e, "Couldn't dial WebSocket backend");
                return json_error_response(
                    ProxyErrorCode::ConnectionFailed,
                    "Failed to connect to backend",
                );
            }
            Err(_) => {
                error!(
                    proxy = %self.name,
                    endpoint = %endpoint,
                    timeout_ms = self.connect_timeout.as_millis() as u64,
                    "Timed out dialing WebSocket backend"
                );
                return json_error_response(
                    ProxyErrorCode::RequestTimeout,
                    format!("Backend connection timed out after {:?}", self.connect_timeout),
                );
            }
        };

        // Only the negotiated sub-protocol and cookies travel back to the client
        let mut response = Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, "websocket")
            .header(SEC_WEBSOCKET_ACCEPT, derive_accept_key(client_key.as_bytes()));
        if let Some(protocol) = backend_headers.get(SEC_WEBSOCKET_PROTOCOL) {
            response = response.header(SEC_WEBSOCKET_PROTOCOL, protocol.clone());
        }
        for cookie in backend_headers.get_all(SET_COOKIE) {
            response = response.header(SET_COOKIE, cookie.clone());
        }
        let response = response
            .body(empty_body())
            .expect("valid response builder");

        let on_upgrade = hyper::upgrade::on(&mut req);
        let name = self.name.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    debug!(proxy = %name, endpoint = %endpoint, "Client upgrade complete, starting relay");
                    let client =
                        WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None)
                            .await;
                    relay(&name, client, backend, shutdown).await;
                }
                Err(e) => {
                    error!(proxy = %name, error = %e, "Failed to upgrade client connection");
                }
            }
        });

        response
    }

    async fn send(&self, _req: Request<ProxyBody>) -> Result<Response<Incoming>, ProxyError> {
        Err(ProxyError::Unsupported("websocket"))
    }

    fn update_endpoints(&self, endpoints: &[String]) {
        let list = crate::endpoint::create_endpoints(endpoints);
        info!(proxy = %self.name, endpoints = ?list.to_strings(), "Updated WebSocket proxy endpoints");
        self.upstreams.replace(list);
    }
}

/// Why the backend handshake failed
#[derive(Debug, thiserror::Error)]
enum DialError {
    #[error("connect failed: {0}")]
    Connect(#[from] std::io::Error),
    #[error("handshake failed: {0}")]
    Http(#[from] hyper::Error),
    #[error("backend answered {0} instead of switching protocols")]
    Rejected(StatusCode),
    #[error("backend sent a wrong Sec-WebSocket-Accept")]
    BadAccept,
}

/// Run the upgrade handshake against `addr` and wrap the upgraded connection
///
/// The backend may answer without a sub-protocol even when the client
/// offered some; the response headers are returned for the client's 101.
async fn dial_backend(
    addr: &str,
    req: Request<ProxyBody>,
) -> Result<(WebSocketStream<TokioIo<Upgraded>>, HeaderMap), DialError> {
    let expected_accept = req
        .headers()
        .get(SEC_WEBSOCKET_KEY)
        .map(|key| derive_accept_key(key.as_bytes()));

    let stream = TcpStream::connect(addr).await?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!(error = %e, "WebSocket backend connection failed");
        }
    });

    let mut response = sender.send_request(req).await?;
    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Err(DialError::Rejected(response.status()));
    }
    let accept = response
        .headers()
        .get(SEC_WEBSOCKET_ACCEPT)
        .and_then(|v| v.to_str().ok());
    if accept.is_none() || accept != expected_accept.as_deref() {
        return Err(DialError::BadAccept);
    }

    let headers = std::mem::take(response.headers_mut());
    let upgraded = hyper::upgrade::on(&mut response).await?;
    let backend = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Client, None).await;
    Ok((backend, headers))
}

/// The client's `Sec-WebSocket-Key` if `req` is a well-formed upgrade request
fn websocket_key<B>(req: &Request<B>) -> Option<String> {
    if req.method() != Method::GET {
        return None;
    }

    let has_upgrade_connection = req
        .headers()
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")));
    let is_websocket = req
        .headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    if !has_upgrade_connection || !is_websocket {
        return None;
    }

    req.headers()
        .get(SEC_WEBSOCKET_KEY)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    ClientToBackend,
    BackendToClient,
}

impl Direction {
    fn as_str(&self) -> &'static str {
        match self {
            Direction::ClientToBackend => "client to backend",
            Direction::BackendToClient => "backend to client",
        }
    }
}

/// Why one relay direction stopped
#[derive(Debug)]
enum RelayEnd {
    /// The source sent a close frame
    Closed(Option<CloseFrame<'static>>),
    /// The source stream ended without a close frame
    Eof,
    /// Reading or writing failed
    Failed(tungstenite::Error),
}

impl RelayEnd {
    /// A clean close that needs no error log
    fn is_normal(&self) -> bool {
        match self {
            RelayEnd::Closed(None) => true,
            RelayEnd::Closed(Some(frame)) => frame.code != CloseCode::Abnormal,
            RelayEnd::Eof => false,
            RelayEnd::Failed(tungstenite::Error::ConnectionClosed)
            | RelayEnd::Failed(tungstenite::Error::AlreadyClosed) => true,
            RelayEnd::Failed(_) => false,
        }
    }

    fn reason(&self) -> String {
        match self {
            RelayEnd::Closed(None) => "closed without status".to_string(),
            RelayEnd::Closed(Some(frame)) => format!("closed with {} {}", frame.code, frame.reason),
            RelayEnd::Eof => "connection ended without close frame".to_string(),
            RelayEnd::Failed(e) => e.to_string(),
        }
    }
}

/// Copy data frames from `src` to `dst` until `src` closes or an error occurs
///
/// Ping and pong frames are answered per hop and not copied.
async fn replicate<S, K>(src: &mut S, dst: &mut K) -> RelayEnd
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    K: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    loop {
        match src.next().await {
            Some(Ok(Message::Close(frame))) => {
                let _ = dst.send(Message::Close(forwardable(frame.clone()))).await;
                return RelayEnd::Closed(frame);
            }
            Some(Ok(message @ (Message::Text(_) | Message::Binary(_)))) => {
                if let Err(e) = dst.send(message).await {
                    return RelayEnd::Failed(e);
                }
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                let _ = dst.send(Message::Close(Some(close_frame_for(&e)))).await;
                return RelayEnd::Failed(e);
            }
            None => {
                let _ = dst.send(Message::Close(None)).await;
                return RelayEnd::Eof;
            }
        }
    }
}

/// Close codes that must not be sent on the wire are replaced by a normal close
fn forwardable(frame: Option<CloseFrame<'static>>) -> Option<CloseFrame<'static>> {
    frame.map(|frame| match frame.code {
        CloseCode::Status | CloseCode::Abnormal | CloseCode::Tls => CloseFrame {
            code: CloseCode::Normal,
            reason: frame.reason,
        },
        _ => frame,
    })
}

fn close_frame_for(err: &tungstenite::Error) -> CloseFrame<'static> {
    let mut reason = err.to_string();
    if reason.len() > MAX_CLOSE_REASON {
        let mut cut = MAX_CLOSE_REASON;
        while !reason.is_char_boundary(cut) {
            cut -= 1;
        }
        reason.truncate(cut);
    }
    CloseFrame {
        code: CloseCode::Normal,
        reason: Cow::Owned(reason),
    }
}

/// Resolves once the shutdown flag is set; never resolves without a receiver
async fn shutdown_signal(shutdown: &mut Option<watch::Receiver<bool>>) {
    match shutdown {
        Some(rx) => {
            while !*rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        }
        None => std::future::pending::<()>().await,
    }
}

/// Relay frames between an upgraded client and a connected backend
async fn relay<C, B>(
    name: &str,
    client: WebSocketStream<C>,
    backend: WebSocketStream<B>,
    mut shutdown: Option<watch::Receiver<bool>>,
) where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_tx, mut client_rx) = client.split();
    let (mut backend_tx, mut backend_rx) = backend.split();

    let finished = {
        let to_backend = replicate(&mut client_rx, &mut backend_tx);
        let to_client = replicate(&mut backend_rx, &mut client_tx);
        tokio::pin!(to_backend, to_client);

        tokio::select! {
            end = &mut to_backend => {
                let _ = tokio::time::timeout(CLOSE_GRACE, &mut to_client).await;
                Some((Direction::ClientToBackend, end))
            }
            end = &mut to_client => {
                let _ = tokio::time::timeout(CLOSE_GRACE, &mut to_backend).await;
                Some((Direction::BackendToClient, end))
            }
            _ = shutdown_signal(&mut shutdown) => None,
        }
    };

    match finished {
        Some((direction, end)) if end.is_normal() => {
            debug!(proxy = %name, direction = direction.as_str(), reason = %end.reason(), "WebSocket connection closed");
        }
        Some((direction, end)) => {
            error!(proxy = %name, direction = direction.as_str(), reason = %end.reason(), "WebSocket relay ended abnormally");
        }
        None => {
            info!(proxy = %name, "Closing WebSocket relay for shutdown");
            let away = CloseFrame {
                code: CloseCode::Away,
                reason: Cow::Borrowed("proxy shutting down"),
            };
            let _ = tokio::time::timeout(CLOSE_GRACE, client_tx.send(Message::Close(Some(away.clone())))).await;
            let _ = tokio::time::timeout(CLOSE_GRACE, backend_tx.send(Message::Close(Some(away)))).await;
        }
    }

    let _ = tokio::time::timeout(CLOSE_GRACE, client_tx.close()).await;
    let _ = tokio::time::timeout(CLOSE_GRACE, backend_tx.close()).await;
}
