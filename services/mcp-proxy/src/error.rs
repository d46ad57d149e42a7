//! Per-request forwarding errors and their HTTP rendering

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use token_pool::PoolStats;

/// Why an upstream attempt counted as transient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    RateLimited,
    ServerError,
    Timeout,
    Connection,
}

impl TransientKind {
    /// Label for `proxy_upstream_errors_total{error_type}`.
    pub fn label(self) -> &'static str {
        match self {
            TransientKind::RateLimited => "rate_limited",
            TransientKind::ServerError => "server_error",
            TransientKind::Timeout => "timeout",
            TransientKind::Connection => "connection",
        }
    }
}

/// A request the proxy could not complete. `attempts` counts upstream calls
/// actually made.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("no available upstream tokens after {attempts} attempts ({stats})")]
    ExhaustedTokens { attempts: u32, stats: PoolStats },

    #[error("upstream rejected token credentials with HTTP {status} (after {attempts} attempts)")]
    UpstreamAuth { status: u16, attempts: u32 },

    #[error("upstream {} after {attempts} attempts: {detail}", .kind.label())]
    UpstreamTransient {
        kind: TransientKind,
        status: Option<u16>,
        detail: String,
        attempts: u32,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal proxy error: {0}")]
    Internal(String),
}

impl ForwardError {
    /// Stable machine-readable code for the JSON error body.
    pub fn code(&self) -> &'static str {
        match self {
            ForwardError::ExhaustedTokens { .. } => "exhausted_tokens",
            ForwardError::UpstreamAuth { .. } => "upstream_auth",
            ForwardError::UpstreamTransient { .. } => "upstream_transient",
            ForwardError::InvalidRequest(_) => "invalid_request",
            ForwardError::Internal(_) => "internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ForwardError::ExhaustedTokens { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ForwardError::UpstreamAuth { .. } => StatusCode::BAD_GATEWAY,
            ForwardError::UpstreamTransient {
                kind: TransientKind::Timeout,
                ..
            } => StatusCode::GATEWAY_TIMEOUT,
            ForwardError::UpstreamTransient { .. } => StatusCode::BAD_GATEWAY,
            ForwardError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ForwardError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn attempts(&self) -> Option<u32> {
        match self {
            ForwardError::ExhaustedTokens { attempts, .. }
            | ForwardError::UpstreamAuth { attempts, .. }
            | ForwardError::UpstreamTransient { attempts, .. } => Some(*attempts),
            ForwardError::InvalidRequest(_) | ForwardError::Internal(_) => None,
        }
    }

    /// Status of the last rejected upstream response, if there was one.
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            ForwardError::UpstreamAuth { status, .. } => Some(*status),
            ForwardError::UpstreamTransient { status, .. } => *status,
            _ => None,
        }
    }

    /// Render as a JSON error response tagged with the request id.
    pub fn into_response_with_id(self, request_id: &str) -> Response {
        error_response(
            self.status_code(),
            self.code(),
            &self.to_string(),
            request_id,
            self.attempts(),
        )
    }
}

/// JSON error body: `{"error":{"type":"proxy_error","code",...}}`.
///
/// Messages never contain token values; callers pass redacted detail only.
pub fn error_response(
    status: StatusCode,
    code: &str,
    message: &str,
    request_id: &str,
    attempts: Option<u32>,
) -> Response {
    let mut error = serde_json::json!({
        "type": "proxy_error",
        "code": code,
        "message": message,
        "request_id": request_id,
    });
    if let Some(attempts) = attempts {
        error["attempts"] = attempts.into();
    }
    let mut response = (status, axum::Json(serde_json::json!({ "error": error }))).into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}
