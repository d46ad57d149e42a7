//! MCP Token Proxy
//!
//! Single-binary Rust service that:
//! 1. Loads upstream API tokens from a flat credential file
//! 2. Listens for MCP streamable-HTTP requests
//! 3. Answers `ping` and `notifications/initialized` locally
//! 4. Forwards everything else upstream with a pooled token, rotating tokens
//!    on rejection and persisting revoked ones to a blacklist ledger
//! 5. Relays event-stream responses incrementally

mod config;
mod control;
mod engine;
mod error;
mod metrics;
mod proxy;
mod relay;
mod status;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::body::Body;
use axum::extract::{FromRef, State};
use axum::http::{HeaderValue, Request, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use token_pool::{BlacklistLedger, CredentialStore, TokenPool};

use crate::config::{Config, ProxyConfig};
use crate::engine::ForwardingEngine;
use crate::metrics::ServiceMetrics;
use crate::proxy::ProxyState;
use crate::status::StatusState;

/// Time allowed for in-flight requests after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// User-Agent sent upstream when the client supplies none.
const USER_AGENT: &str = concat!("mcp-token-proxy/", env!("CARGO_PKG_VERSION"));

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    status: StatusState,
    metrics: ServiceMetrics,
    prometheus: PrometheusHandle,
}

impl FromRef<AppState> for StatusState {
    fn from_ref(state: &AppState) -> Self {
        state.status.clone()
    }
}

fn build_state(
    config: &ProxyConfig,
    pool: Arc<TokenPool>,
    client: reqwest::Client,
    prometheus: PrometheusHandle,
) -> common::Result<AppState> {
    let metrics = ServiceMetrics::new();
    let engine = ForwardingEngine::new(client, pool, config)?;
    let status = StatusState::new(engine.pool().clone(), config.upstream_url.clone());
    Ok(AppState {
        proxy: ProxyState {
            engine,
            metrics: metrics.clone(),
            user_agent: HeaderValue::from_static(USER_AGENT),
        },
        status,
        metrics,
        prometheus,
    })
}

/// Build the axum router with all routes and shared state.
///
/// `max_connections` bounds concurrently handled requests; excess requests
/// queue in the limit layer.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/", get(root_handler).fallback(proxy_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .merge(status::router::<AppState>())
        .fallback(proxy_handler)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting mcp-token-proxy");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder().context("failed to install metrics recorder")?;

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load_or_default(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.proxy.listen_addr,
        upstream_url = %config.proxy.upstream_url,
        max_retries = config.proxy.max_retries,
        timeout_secs = config.proxy.timeout_secs,
        accounts_file = %config.tokens.accounts_file.display(),
        blacklist_file = %config.tokens.blacklist_file.display(),
        "configuration loaded"
    );

    let ledger = BlacklistLedger::load(config.tokens.blacklist_file.clone())
        .await
        .context("failed to load blacklist ledger")?;
    let credentials =
        CredentialStore::load(config.tokens.accounts_file.clone(), &config.tokens.token_prefix)
            .await
            .context("failed to load credentials")?;
    let pool = TokenPool::new(credentials.tokens(), Arc::new(ledger))
        .await
        .with_context(|| {
            format!(
                "no usable tokens in {}",
                config.tokens.accounts_file.display()
            )
        })?;
    let stats = pool.stats().await;
    info!(
        total = stats.total,
        available = stats.available,
        blacklisted = stats.blacklisted,
        "token pool ready"
    );

    let client = reqwest::Client::builder()
        .connect_timeout(config.proxy.timeout())
        .build()
        .context("failed to build HTTP client")?;

    let app_state = build_state(&config.proxy, Arc::new(pool), client, prometheus_handle)?;
    let in_flight = app_state.metrics.in_flight.clone();
    let app = build_router(app_state, config.proxy.max_connections);

    let listen_addr = config.proxy.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timer starts when the signal arrives, not when serving starts.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            let remaining = in_flight.load(Ordering::Relaxed);
            warn!(
                remaining,
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: pool health plus process counters.
/// Returns 503 when no token is usable.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let pool = state.proxy.engine.pool();
    let health = pool.health().await;
    let stats = pool.stats().await;

    let status_code = if health == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    let body = serde_json::json!({
        "status": health,
        "token_stats": stats,
        "uptime_seconds": state.metrics.started_at.elapsed().as_secs(),
        "requests_served": state.metrics.requests_total.load(Ordering::Relaxed),
        "errors_total": state.metrics.errors_total.load(Ordering::Relaxed),
        "in_flight": state.metrics.in_flight.load(Ordering::Relaxed),
    });

    (
        status_code,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// GET / serves the status banner, unless the client is opening an event
/// stream, which belongs to the upstream MCP server.
async fn root_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let wants_stream = request
        .headers()
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("text/event-stream"));
    if wants_stream {
        return proxy_handler(State(state), request).await;
    }
    status::root(State(state.status)).await.into_response()
}

/// Catch-all handler that proxies every non-status request upstream.
async fn proxy_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    proxy::proxy_request(&state.proxy, request, request_id).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
