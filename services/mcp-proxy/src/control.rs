//! Local answers for MCP control methods
//!
//! `ping` and `notifications/initialized` are keep-alive and handshake
//! traffic. Answering them here keeps them from spending a token or an
//! upstream round trip. The check runs before any token is acquired.

use axum::body::Body;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::Response;
use serde::Deserialize;
use serde_json::Value;

use crate::metrics;

pub const PING_METHOD: &str = "ping";
pub const INITIALIZED_NOTIFICATION: &str = "notifications/initialized";

/// A control method recognised in a request body.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMethod {
    /// Echoes `id` back with an empty result. A missing id echoes `null`.
    Ping { id: Value },
    Initialized,
}

impl ControlMethod {
    pub fn name(&self) -> &'static str {
        match self {
            ControlMethod::Ping { .. } => PING_METHOD,
            ControlMethod::Initialized => INITIALIZED_NOTIFICATION,
        }
    }
}

#[derive(Deserialize)]
struct Envelope {
    method: Option<String>,
    #[serde(default)]
    id: Value,
}

/// Detect a control method in a single JSON-RPC request body.
///
/// Batches, non-JSON bodies and every other method return `None` and are
/// forwarded unchanged.
pub fn detect(body: &[u8]) -> Option<ControlMethod> {
    let first = body.iter().find(|b| !b.is_ascii_whitespace())?;
    if *first != b'{' {
        return None;
    }
    let envelope: Envelope = serde_json::from_slice(body).ok()?;
    match envelope.method.as_deref()? {
        PING_METHOD => Some(ControlMethod::Ping { id: envelope.id }),
        INITIALIZED_NOTIFICATION => Some(ControlMethod::Initialized),
        _ => None,
    }
}

/// Canned reply for a detected control method.
pub fn respond(method: &ControlMethod) -> Response {
    metrics::record_control_method(method.name());
    let (status, body) = match method {
        ControlMethod::Ping { id } => {
            let envelope = serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {},
            });
            (StatusCode::OK, Body::from(envelope.to_string()))
        }
        ControlMethod::Initialized => (StatusCode::ACCEPTED, Body::empty()),
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

/// Answer `body` locally if it is a control method.
pub fn intercept(body: &[u8]) -> Option<Response> {
    let method = detect(body)?;
    tracing::debug!(method = method.name(), "answering control method locally");
    Some(respond(&method))
}
