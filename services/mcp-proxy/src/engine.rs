//! Upstream forwarding with token rotation and retry
//!
//! Each attempt takes a fresh token from the pool, injects it as a query
//! parameter, and classifies the upstream outcome:
//!
//! | outcome            | pool action        | request          |
//! |--------------------|--------------------|------------------|
//! | 2xx/3xx            | none               | return response  |
//! | 401/403            | blacklist, persist | retry            |
//! | 429                | temporary failure  | retry            |
//! | 5xx/timeout/network| temporary failure  | retry            |
//! | other 4xx          | none               | return response  |
//!
//! An empty pool fails the request immediately without an upstream call.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, Method};
use bytes::Bytes;
use reqwest::Url;
use token_pool::{AcquiredToken, Classification, TokenPool, classify_status};
use tracing::{debug, error, info, warn};
use url::form_urlencoded;

use crate::config::{ProxyConfig, RetryBackoff};
use crate::error::{ForwardError, TransientKind};
use crate::metrics;

/// A client request prepared for forwarding. Headers are already filtered;
/// the body is fully buffered so it can be replayed on retry.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    /// Client path plus raw query, e.g. `/?session=1`.
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// The upstream response that ended the retry loop.
#[derive(Debug)]
pub struct Forwarded {
    pub response: reqwest::Response,
    /// Upstream calls made, the successful one included.
    pub attempts: u32,
}

#[derive(Clone)]
pub struct ForwardingEngine {
    client: reqwest::Client,
    pool: Arc<TokenPool>,
    upstream: Url,
    token_param: String,
    timeout: Duration,
    max_retries: u32,
    retry_backoff: RetryBackoff,
}

impl ForwardingEngine {
    pub fn new(
        client: reqwest::Client,
        pool: Arc<TokenPool>,
        config: &ProxyConfig,
    ) -> common::Result<Self> {
        let upstream = Url::parse(&config.upstream_url).map_err(|e| {
            common::Error::Config(format!("invalid upstream_url {}: {e}", config.upstream_url))
        })?;
        Ok(Self {
            client,
            pool,
            upstream,
            token_param: config.token_param.clone(),
            timeout: config.timeout(),
            max_retries: config.max_retries.max(1),
            retry_backoff: config.retry_backoff(),
        })
    }

    pub fn pool(&self) -> &Arc<TokenPool> {
        &self.pool
    }

    /// Time allowed for response headers, and separately for reading a
    /// buffered (non-streaming) body.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Forward `request` upstream, rotating tokens across failed attempts.
    pub async fn forward(&self, request: &UpstreamRequest) -> Result<Forwarded, ForwardError> {
        let mut last_error = None;

        for attempt in 1..=self.max_retries {
            let token = match self.pool.acquire().await {
                Ok(token) => token,
                Err(token_pool::Error::Exhausted { stats }) => {
                    warn!(attempt, %stats, "no available tokens");
                    return Err(ForwardError::ExhaustedTokens {
                        attempts: attempt - 1,
                        stats,
                    });
                }
                Err(e) => return Err(ForwardError::Internal(e.to_string())),
            };

            let (classification, failure) = match self.attempt(request, &token).await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let classification = classify_status(status);
                    if !classification.is_retryable() {
                        info!(
                            attempt,
                            status,
                            token = %token.redacted(),
                            classification = classification.label(),
                            "upstream responded"
                        );
                        return Ok(Forwarded {
                            response,
                            attempts: attempt,
                        });
                    }
                    // The rejected response is dropped here, releasing its connection.
                    (classification, self.status_failure(status, classification, attempt))
                }
                Err((kind, detail)) => (
                    Classification::Transient,
                    ForwardError::UpstreamTransient {
                        kind,
                        status: None,
                        detail,
                        attempts: attempt,
                    },
                ),
            };

            metrics::record_upstream_error(match &failure {
                ForwardError::UpstreamAuth { .. } => "auth",
                ForwardError::UpstreamTransient { kind, .. } => kind.label(),
                _ => "other",
            });
            warn!(
                attempt,
                max_attempts = self.max_retries,
                token = %token.redacted(),
                classification = classification.label(),
                error = %failure,
                "upstream attempt failed"
            );
            if let Err(e) = self.pool.report_outcome(&token, classification).await {
                metrics::record_blacklist_persist_failure();
                error!(token = %token.redacted(), error = %e, "failed to persist blacklisted token");
            }

            let pause = self.backoff_after(&failure);
            last_error = Some(failure);
            if attempt < self.max_retries && !pause.is_zero() {
                debug!(attempt, pause_ms = pause.as_millis() as u64, "pausing before retry");
                tokio::time::sleep(pause).await;
            }
        }

        Err(last_error
            .unwrap_or_else(|| ForwardError::Internal("no upstream attempt was made".into())))
    }

    /// Pause before the attempt that follows `failure`.
    fn backoff_after(&self, failure: &ForwardError) -> Duration {
        match failure {
            ForwardError::UpstreamTransient { kind, .. } => match kind {
                TransientKind::RateLimited => self.retry_backoff.rate_limited,
                TransientKind::ServerError => self.retry_backoff.server_error,
                TransientKind::Timeout | TransientKind::Connection => self.retry_backoff.network,
            },
            _ => Duration::ZERO,
        }
    }

    /// One upstream call. Errs with a transient kind and a redacted detail on
    /// timeout or transport failure.
    async fn attempt(
        &self,
        request: &UpstreamRequest,
        token: &AcquiredToken,
    ) -> Result<reqwest::Response, (TransientKind, String)> {
        let url = self.upstream_url(&request.path_and_query, token.value());
        debug!(method = %request.method, path = url.path(), "sending upstream request");

        let send = self
            .client
            .request(request.method.clone(), url)
            .headers(request.headers.clone())
            .body(request.body.clone())
            .send();

        match tokio::time::timeout(self.timeout, send).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                let kind = if e.is_timeout() {
                    TransientKind::Timeout
                } else {
                    TransientKind::Connection
                };
                // reqwest errors embed the URL, which carries the token.
                Err((kind, e.without_url().to_string()))
            }
            Err(_) => Err((
                TransientKind::Timeout,
                format!("no response within {}s", self.timeout.as_secs()),
            )),
        }
    }

    fn status_failure(
        &self,
        status: u16,
        classification: Classification,
        attempt: u32,
    ) -> ForwardError {
        match classification {
            Classification::AuthFailure => ForwardError::UpstreamAuth {
                status,
                attempts: attempt,
            },
            Classification::RateLimited => ForwardError::UpstreamTransient {
                kind: TransientKind::RateLimited,
                status: Some(status),
                detail: format!("HTTP {status}"),
                attempts: attempt,
            },
            _ => ForwardError::UpstreamTransient {
                kind: TransientKind::ServerError,
                status: Some(status),
                detail: format!("HTTP {status}"),
                attempts: attempt,
            },
        }
    }

    /// Upstream URL for a client path: the configured base path joined with
    /// the client path, base and client query segments kept byte-for-byte,
    /// any client-supplied token parameter replaced by `token`.
    fn upstream_url(&self, path_and_query: &str, token: &str) -> Url {
        let (path, query) = match path_and_query.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (path_and_query, None),
        };

        let mut url = self.upstream.clone();
        if !path.is_empty() && path != "/" {
            let joined = format!("{}{}", url.path().trim_end_matches('/'), path);
            url.set_path(&joined);
        }

        let kept: Vec<&str> = [self.upstream.query(), query]
            .into_iter()
            .flatten()
            .flat_map(|q| q.split('&'))
            .filter(|segment| !segment.is_empty() && !self.is_token_segment(segment))
            .collect();

        url.set_query(Some(&kept.join("&")));
        url.query_pairs_mut().append_pair(&self.token_param, token);
        url
    }

    /// Whether a raw `key[=value]` query segment names the token parameter.
    fn is_token_segment(&self, segment: &str) -> bool {
        form_urlencoded::parse(segment.as_bytes())
            .next()
            .is_some_and(|(key, _)| key == self.token_param.as_str())
    }
}
