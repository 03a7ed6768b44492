//! Error types and plain-text error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use thiserror::Error;

/// Failure of `Supervisor::ensure_running` / `Supervisor::restart`.
///
/// `Clone` because one start outcome is handed to every caller waiting on it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SupervisorError {
    /// No gateway configuration exists yet
    #[error("gateway is not configured")]
    NotConfigured,
    /// Spawn error or readiness timeout
    #[error("gateway failed to start: {0}")]
    StartFailed(String),
}

/// Returned from the connection service to drop the client socket without
/// writing any response
#[derive(Debug, Error)]
#[error("connection rejected: {0}")]
pub struct ConnectionRejected(pub String);

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorCode {
    /// Gateway has not been configured
    NotConfigured,
    /// Gateway failed to start or become ready
    GatewayStartFailed,
    /// Request timed out waiting for the gateway
    RequestTimeout,
    /// Failed to connect to the gateway
    ConnectionFailed,
    /// Missing or wrong bearer token on a wrapper route
    Unauthorized,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::NotConfigured => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::GatewayStartFailed => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::NotConfigured => "NOT_CONFIGURED",
            ProxyErrorCode::GatewayStartFailed => "GATEWAY_START_FAILED",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::Unauthorized => "UNAUTHORIZED",
        }
    }
}

impl From<&SupervisorError> for ProxyErrorCode {
    fn from(err: &SupervisorError) -> Self {
        match err {
            SupervisorError::NotConfigured => ProxyErrorCode::NotConfigured,
            SupervisorError::StartFailed(_) => ProxyErrorCode::GatewayStartFailed,
        }
    }
}

/// Create a plain-text error response with X-Proxy-Error header
pub fn text_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut body = message.into();
    body.push('\n');

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "text/plain; charset=utf-8")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
