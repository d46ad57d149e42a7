//! HTTP proxy logic
//!
//! Buffers the inbound body, answers control methods locally, and hands
//! everything else to the forwarding engine. Upstream responses come back
//! with their status and end-to-end headers; event streams are relayed
//! chunk by chunk, other bodies are read in full under the upstream timeout.

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode, header};
use axum::response::Response;
use std::time::Instant;
use tracing::{error, info, instrument, warn};

use crate::control;
use crate::engine::{Forwarded, ForwardingEngine, UpstreamRequest};
use crate::error::{ForwardError, error_response};
use crate::metrics::{self, ServiceMetrics};
use crate::relay;

/// Inbound bodies larger than this are rejected with 400.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Accept value sent upstream when the client gives none. MCP streamable
/// HTTP servers may answer with either representation.
pub const DEFAULT_ACCEPT: &str = "application/json, text/event-stream";

pub const ATTEMPTS_HEADER: &str = "x-proxy-attempts";

/// Headers to strip in both directions (hop-by-hop per RFC 7230 Section 6.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Shared state passed to the proxy handler
#[derive(Clone)]
pub struct ProxyState {
    pub engine: ForwardingEngine,
    pub metrics: ServiceMetrics,
    pub user_agent: HeaderValue,
}

/// Proxy one inbound request and record its outcome.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn proxy_request(state: &ProxyState, request: Request<Body>, request_id: String) -> Response {
    let started = Instant::now();
    let _in_flight = state.metrics.begin_request();
    let method = request.method().clone();

    let response = handle(state, request, &request_id).await;

    metrics::record_request(
        response.status().as_u16(),
        method.as_str(),
        started.elapsed().as_secs_f64(),
    );
    response
}

async fn handle(state: &ProxyState, request: Request<Body>, request_id: &str) -> Response {
    let (parts, body) = request.into_parts();

    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            state.metrics.record_error();
            warn!(error = %e, "failed to read request body");
            return ForwardError::InvalidRequest(format!("invalid request body: {e}"))
                .into_response_with_id(request_id);
        }
    };

    if let Some(reply) = control::intercept(&body) {
        return reply;
    }

    let upstream_request = UpstreamRequest {
        method: parts.method,
        path_and_query: parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string()),
        headers: upstream_headers(&parts.headers, &state.user_agent),
        body,
    };

    match state.engine.forward(&upstream_request).await {
        Ok(forwarded) => into_client_response(state, forwarded, request_id).await,
        Err(e) => {
            state.metrics.record_error();
            error!(
                code = e.code(),
                attempts = e.attempts(),
                upstream_status = e.upstream_status(),
                error = %e,
                "request failed"
            );
            e.into_response_with_id(request_id)
        }
    }
}

/// Build the client response from the upstream one.
async fn into_client_response(state: &ProxyState, forwarded: Forwarded, request_id: &str) -> Response {
    let Forwarded { response, attempts } = forwarded;
    let status = response.status();
    let streaming = is_streaming(response.headers());
    let headers = response_headers(response.headers(), attempts);

    let body = if streaming {
        info!(status = status.as_u16(), attempts, "relaying upstream stream");
        relay::relay_body(response.bytes_stream())
    } else {
        match tokio::time::timeout(state.engine.timeout(), response.bytes()).await {
            Ok(Ok(bytes)) => Body::from(bytes),
            Ok(Err(e)) => {
                let e = e.without_url();
                state.metrics.record_error();
                error!(error = %e, "failed to read upstream response body");
                return upstream_read_error(&e.to_string(), false, attempts, request_id);
            }
            Err(_) => {
                state.metrics.record_error();
                error!("timed out reading upstream response body");
                return upstream_read_error("response body timed out", true, attempts, request_id);
            }
        }
    };

    let mut client_response = Response::new(body);
    *client_response.status_mut() = status;
    *client_response.headers_mut() = headers;
    client_response
}

fn upstream_read_error(detail: &str, timed_out: bool, attempts: u32, request_id: &str) -> Response {
    let status = if timed_out {
        StatusCode::GATEWAY_TIMEOUT
    } else {
        StatusCode::BAD_GATEWAY
    };
    error_response(
        status,
        "upstream_transient",
        &format!("upstream response read error: {detail}"),
        request_id,
        Some(attempts),
    )
}

/// Client headers to send upstream: hop-by-hop, `Host` and `Content-Length`
/// removed, `Accept` defaulted or extended with `text/event-stream`, and a
/// `User-Agent` supplied when the client sent none.
pub fn upstream_headers(client: &HeaderMap, user_agent: &HeaderValue) -> HeaderMap {
    let listed = connection_listed(client);
    let mut headers = HeaderMap::with_capacity(client.len() + 2);
    for (name, value) in client {
        if is_hop_by_hop(name.as_str())
            || listed.contains(name)
            || name == header::HOST
            || name == header::CONTENT_LENGTH
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    let accept = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    match accept {
        None => {
            headers.insert(header::ACCEPT, HeaderValue::from_static(DEFAULT_ACCEPT));
        }
        Some(accept) if !accept.contains("text/event-stream") => {
            if let Ok(value) = HeaderValue::from_str(&format!("{accept}, text/event-stream")) {
                headers.insert(header::ACCEPT, value);
            }
        }
        Some(_) => {}
    }

    if !headers.contains_key(header::USER_AGENT) {
        headers.insert(header::USER_AGENT, user_agent.clone());
    }
    headers
}

/// Upstream headers to return to the client: hop-by-hop and
/// `Content-Length` removed (the body is re-framed), attempt count added.
pub fn response_headers(upstream: &HeaderMap, attempts: u32) -> HeaderMap {
    let listed = connection_listed(upstream);
    let mut headers = HeaderMap::with_capacity(upstream.len() + 1);
    for (name, value) in upstream {
        if is_hop_by_hop(name.as_str()) || listed.contains(name) || name == header::CONTENT_LENGTH
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers.insert(HeaderName::from_static(ATTEMPTS_HEADER), HeaderValue::from(attempts));
    headers
}

/// Header names nominated as hop-by-hop by the `Connection` header.
fn connection_listed(headers: &HeaderMap) -> Vec<HeaderName> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect()
}

/// Event streams and NDJSON are relayed incrementally.
pub fn is_streaming(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| {
            let ct = ct.to_ascii_lowercase();
            ct.starts_with("text/event-stream") || ct.starts_with("application/x-ndjson")
        })
        .unwrap_or(false)
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}
