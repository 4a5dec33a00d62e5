//! Error types and JSON error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// No route matches the request path
    NoRoute,
    /// The proxy has no endpoint to forward to
    NoUpstream,
    /// Request is not a valid WebSocket upgrade
    InvalidUpgrade,
    /// Operation not supported by this transport
    Unsupported,
    /// Request timed out waiting for backend
    RequestTimeout,
    /// Failed to connect to backend
    ConnectionFailed,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::NoRoute => StatusCode::NOT_FOUND,
            ProxyErrorCode::NoUpstream => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::InvalidUpgrade => StatusCode::BAD_REQUEST,
            ProxyErrorCode::Unsupported => StatusCode::NOT_IMPLEMENTED,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::NoRoute => "NO_ROUTE",
            ProxyErrorCode::NoUpstream => "NO_UPSTREAM",
            ProxyErrorCode::InvalidUpgrade => "INVALID_UPGRADE",
            ProxyErrorCode::Unsupported => "UNSUPPORTED",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Selection against an empty endpoint list
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("no upstream endpoint available")]
pub struct NoUpstream;

/// Errors surfaced by [`Proxy::send`](crate::proxy::Proxy::send)
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("no upstream endpoint available")]
    NoUpstream,
    #[error("operation not supported by the {0} transport")]
    Unsupported(&'static str),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("upstream request failed: {0}")]
    Upstream(#[from] crate::pool::PoolError),
    #[error("upstream timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl From<NoUpstream> for ProxyError {
    fn from(_: NoUpstream) -> Self {
        ProxyError::NoUpstream
    }
}

impl ProxyError {
    /// Error code used when this error becomes a client response
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            ProxyError::NoUpstream => ProxyErrorCode::NoUpstream,
            ProxyError::Unsupported(_) => ProxyErrorCode::Unsupported,
            ProxyError::InvalidRequest(_) => ProxyErrorCode::InternalError,
            ProxyError::Upstream(_) => ProxyErrorCode::ConnectionFailed,
            ProxyError::Timeout(_) => ProxyErrorCode::RequestTimeout,
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            ProxyErrorCode::NoUpstream.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(ProxyErrorCode::NoRoute.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            ProxyErrorCode::RequestTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ProxyErrorCode::ConnectionFailed.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyErrorCode::Unsupported.status_code(),
            StatusCode::NOT_IMPLEMENTED
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ProxyErrorCode::NoUpstream, "No backend for acp_node");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"NO_UPSTREAM\""));
        assert!(json.contains("\"message\":\"No backend for acp_node\""));
        assert!(json.contains("\"status\":503"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(ProxyErrorCode::RequestTimeout, "Request timed out");

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "REQUEST_TIMEOUT"
        );
    }

    #[test]
    fn test_proxy_error_codes() {
        assert_eq!(ProxyError::from(NoUpstream).code(), ProxyErrorCode::NoUpstream);
        assert_eq!(
            ProxyError::Unsupported("websocket").code(),
            ProxyErrorCode::Unsupported
        );
        assert_eq!(
            ProxyError::Unsupported("websocket").to_string(),
            "operation not supported by the websocket transport"
        );
    }
}
