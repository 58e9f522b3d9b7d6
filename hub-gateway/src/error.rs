//! # Error Handling
//!
//! Every failure the gateway can synthesize a response for is a
//! [`GatewayError`] variant. Each variant maps to one HTTP status and renders as
//! a short `text/plain` diagnostic that still carries the CORS headers, so a
//! browser caller can read why the request failed.
//!
//! | Variant | Status |
//! |---|---|
//! | [`GatewayError::InvalidPath`] | 400 |
//! | [`GatewayError::InvalidUrl`] | 400 |
//! | [`GatewayError::AuthUpstream`] | 500 |
//! | [`GatewayError::ProxyLoop`] | 508 |
//! | [`GatewayError::UpstreamTimeout`] | 504 |
//! | [`GatewayError::UpstreamConnect`] | 502 |
//! | [`GatewayError::Config`], [`GatewayError::Internal`] | 500 |

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};

use crate::headers::apply_cors;

/// Machine-readable classification of a [`GatewayError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidPath,
    InvalidUrl,
    AuthUpstream,
    ProxyLoop,
    UpstreamTimeout,
    UpstreamConnect,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidPath => "invalid_path",
            ErrorCode::InvalidUrl => "invalid_url",
            ErrorCode::AuthUpstream => "auth_upstream",
            ErrorCode::ProxyLoop => "proxy_loop",
            ErrorCode::UpstreamTimeout => "upstream_timeout",
            ErrorCode::UpstreamConnect => "upstream_connect",
            ErrorCode::Internal => "internal_error",
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            ErrorCode::InvalidPath | ErrorCode::InvalidUrl => StatusCode::BAD_REQUEST,
            ErrorCode::AuthUpstream | ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::ProxyLoop => StatusCode::LOOP_DETECTED,
            ErrorCode::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::UpstreamConnect => StatusCode::BAD_GATEWAY,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// A registry API path is missing its repository segment.
    #[error("Invalid repository path: {0}")]
    InvalidPath(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// The token service was unreachable, answered non-2xx, or sent an
    /// unusable body.
    #[error("Failed to obtain authentication token: {0}")]
    AuthUpstream(String),

    #[error("Redirect limit of {limit} exceeded at {location}")]
    ProxyLoop { limit: usize, location: String },

    #[error("Upstream {host} did not respond in time")]
    UpstreamTimeout { host: String },

    #[error("Failed to reach upstream {host}: {reason}")]
    UpstreamConnect { host: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl GatewayError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            GatewayError::InvalidPath(_) => ErrorCode::InvalidPath,
            GatewayError::InvalidUrl(_) => ErrorCode::InvalidUrl,
            GatewayError::AuthUpstream(_) => ErrorCode::AuthUpstream,
            GatewayError::ProxyLoop { .. } => ErrorCode::ProxyLoop,
            GatewayError::UpstreamTimeout { .. } => ErrorCode::UpstreamTimeout,
            GatewayError::UpstreamConnect { .. } => ErrorCode::UpstreamConnect,
            GatewayError::Config(_)
            | GatewayError::Internal(_)
            | GatewayError::Io(_)
            | GatewayError::Json(_) => ErrorCode::Internal,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.error_code().http_status()
    }

    /// Classifies a reqwest transport failure against `host`.
    pub fn from_transport(host: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::UpstreamTimeout {
                host: host.to_string(),
            }
        } else {
            GatewayError::UpstreamConnect {
                host: host.to_string(),
                reason: err.to_string(),
            }
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let code = self.error_code();
        let status = code.http_status();

        if status.is_server_error() {
            tracing::error!(error = %self, code = code.as_str(), "Request failed");
        } else {
            tracing::warn!(error = %self, code = code.as_str(), "Request rejected");
        }

        let mut response = (status, self.to_string()).into_response();
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        apply_cors(headers, None);
        response
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
