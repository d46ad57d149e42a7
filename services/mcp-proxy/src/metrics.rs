//! Prometheus metrics exposition
//!
//! - `proxy_requests_total` (counter): labels `status`, `method`
//! - `proxy_request_duration_seconds` (histogram): label `status`
//! - `proxy_upstream_errors_total` (counter): label `error_type`
//! - `proxy_control_methods_total` (counter): label `method`
//! - `proxy_stream_relays_total` (counter): label `outcome`
//! - `proxy_blacklist_persist_failures_total` (counter)
//!
//! Token state transitions (`proxy_token_transitions_total`) are recorded by
//! the token pool itself.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Histogram boundaries from 5ms up to the default 300s upstream timeout.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

fn builder() -> anyhow::Result<PrometheusBuilder> {
    Ok(PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("proxy_request_duration_seconds".to_string()),
        DURATION_BUCKETS,
    )?)
}

/// Install the global Prometheus recorder and return a handle for `/metrics`.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    Ok(builder()?.install_recorder()?)
}

/// Record a completed proxy request with status code and HTTP method labels.
///
/// For streamed responses the duration covers time to response headers.
pub fn record_request(status: u16, method: &str, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!("proxy_requests_total", "status" => status_str.clone(), "method" => method.to_string())
        .increment(1);
    metrics::histogram!("proxy_request_duration_seconds", "status" => status_str)
        .record(duration_secs);
}

/// Record a failed upstream attempt: `auth`, `rate_limited`, `server_error`,
/// `timeout` or `connection`.
pub fn record_upstream_error(error_type: &'static str) {
    metrics::counter!("proxy_upstream_errors_total", "error_type" => error_type).increment(1);
}

/// Record a control method answered locally.
pub fn record_control_method(method: &'static str) {
    metrics::counter!("proxy_control_methods_total", "method" => method).increment(1);
}

/// Record how a streamed response ended.
pub fn record_relay_outcome(outcome: &'static str) {
    metrics::counter!("proxy_stream_relays_total", "outcome" => outcome).increment(1);
}

/// Record a blacklisting that could not be written to the ledger. The token
/// is still out of rotation in memory but will return after a restart.
pub fn record_blacklist_persist_failure() {
    metrics::counter!("proxy_blacklist_persist_failures_total").increment(1);
}

/// Process-local counters surfaced on `/health`.
#[derive(Clone)]
pub struct ServiceMetrics {
    pub started_at: Instant,
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    pub in_flight: Arc<AtomicU64>,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Count a request and mark it in flight until the guard drops.
    pub fn begin_request(&self) -> InFlightGuard {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: self.in_flight.clone(),
        }
    }

    pub fn record_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight gauge on drop, including on early return.
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
