//! Read-only status endpoints
//!
//! Served on the main listener next to the proxy. Every token is shown as a
//! fixed-length prefix plus its length, never in full.
//!
//! Endpoints:
//! - GET /          service name, state and pool counts
//! - GET /stats     pool counts plus upstream and version
//! - GET /blacklist ledger size, path and a redacted preview
//! - GET /tokens    per-token status, failure count and last use

use std::sync::Arc;

use axum::Router;
use axum::extract::{FromRef, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;

use token_pool::TokenPool;

pub const SERVICE_NAME: &str = "mcp-token-proxy";

/// Redacted entries shown by `/blacklist`.
const BLACKLIST_PREVIEW_LIMIT: usize = 10;

/// Shared state for status handlers.
#[derive(Clone)]
pub struct StatusState {
    pool: Arc<TokenPool>,
    upstream_url: String,
}

impl StatusState {
    pub fn new(pool: Arc<TokenPool>, upstream_url: impl Into<String>) -> Self {
        Self {
            pool,
            upstream_url: upstream_url.into(),
        }
    }
}

/// Status routes other than `/`, which the caller mounts itself so that
/// non-GET requests to `/` can still reach the proxy.
pub fn router<S>() -> Router<S>
where
    StatusState: FromRef<S>,
    S: Clone + Send + Sync + 'static,
{
    Router::new()
        .route("/stats", get(stats))
        .route("/blacklist", get(blacklist))
        .route("/tokens", get(tokens))
}

fn json_ok(body: serde_json::Value) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// GET /: service banner with pool counts.
pub async fn root(State(state): State<StatusState>) -> impl IntoResponse {
    let stats = state.pool.stats().await;
    json_ok(serde_json::json!({
        "service": SERVICE_NAME,
        "status": "running",
        "token_stats": stats,
    }))
}

async fn stats(State(state): State<StatusState>) -> impl IntoResponse {
    let stats = state.pool.stats().await;
    json_ok(serde_json::json!({
        "token_stats": stats,
        "service_info": {
            "upstream_url": state.upstream_url,
            "version": env!("CARGO_PKG_VERSION"),
        },
    }))
}

async fn blacklist(State(state): State<StatusState>) -> impl IntoResponse {
    let ledger = state.pool.ledger();
    let stats = state.pool.stats().await;
    json_ok(serde_json::json!({
        "blacklist_info": {
            "total_blacklisted": ledger.len().await,
            "blacklist_file": ledger.path().display().to_string(),
            "preview": ledger.preview(BLACKLIST_PREVIEW_LIMIT).await,
        },
        "stats": stats,
    }))
}

async fn tokens(State(state): State<StatusState>) -> impl IntoResponse {
    json_ok(serde_json::json!({ "tokens": state.pool.tokens().await }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use token_pool::BlacklistLedger;
    use tower::ServiceExt;

    const SECRET_A: &str = "sk-aaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const SECRET_B: &str = "sk-bbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    async fn test_state(dir: &std::path::Path) -> StatusState {
        let ledger = Arc::new(
            BlacklistLedger::load(dir.join("blacklist.jsonl"))
                .await
                .unwrap(),
        );
        let pool = TokenPool::new(vec![SECRET_A.into(), SECRET_B.into()], ledger)
            .await
            .unwrap();
        StatusState::new(Arc::new(pool), "https://upstream.example/mcp/")
    }

    fn app(state: StatusState) -> Router {
        router().route("/", get(root)).with_state(state)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, String, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        let json = serde_json::from_str(&text).unwrap();
        (status, text, json)
    }

    #[tokio::test]
    async fn root_reports_service_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let (status, _, json) = get_json(app(test_state(dir.path()).await), "/").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["service"], SERVICE_NAME);
        assert_eq!(json["status"], "running");
        assert_eq!(json["token_stats"]["total"], 2);
        assert_eq!(json["token_stats"]["available"], 2);
    }

    #[tokio::test]
    async fn stats_include_all_counts_and_service_info() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        state.pool.report_temporary_failure(SECRET_A).await;

        let (_, _, json) = get_json(app(state), "/stats").await;
        let stats = &json["token_stats"];
        assert_eq!(stats["total"], 2);
        assert_eq!(stats["available"], 1);
        assert_eq!(stats["temporarily_failed"], 1);
        assert_eq!(stats["blacklisted"], 0);
        assert_eq!(
            json["service_info"]["upstream_url"],
            "https://upstream.example/mcp/"
        );
        assert_eq!(json["service_info"]["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn blacklist_preview_is_redacted() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        state
            .pool
            .report_blacklist(SECRET_A, "auth_failed")
            .await
            .unwrap();

        let (status, text, json) = get_json(app(state), "/blacklist").await;
        assert_eq!(status, StatusCode::OK);
        assert!(!text.contains(SECRET_A), "full token leaked: {text}");

        let info = &json["blacklist_info"];
        assert_eq!(info["total_blacklisted"], 1);
        assert!(
            info["blacklist_file"]
                .as_str()
                .unwrap()
                .ends_with("blacklist.jsonl")
        );
        let preview = info["preview"].as_array().unwrap();
        assert_eq!(preview.len(), 1);
        assert_eq!(preview[0]["token_prefix"], &SECRET_A[..10]);
        assert_eq!(preview[0]["token_length"], SECRET_A.len());
        assert_eq!(json["stats"]["blacklisted"], 1);
    }

    #[tokio::test]
    async fn tokens_view_never_exposes_full_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        state.pool.acquire().await.unwrap();

        let (_, text, json) = get_json(app(state), "/tokens").await;
        assert!(!text.contains(SECRET_A));
        assert!(!text.contains(SECRET_B));

        let tokens = json["tokens"].as_array().unwrap();
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0]["status"], "available");
        assert!(tokens[0]["last_used_at"].is_u64());
        assert_eq!(tokens[1]["failure_count"], 0);
    }
}
