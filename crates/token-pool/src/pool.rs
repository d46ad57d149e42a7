//! Token state machine and round-robin selection
//!
//! The pool holds every loaded token in load order together with its status
//! and a rotation cursor. All status reads and writes happen under one tokio
//! Mutex whose critical sections never span I/O; blacklist persistence runs
//! after the lock is released.
//!
//! When the last available token is parked as temporarily failed, every parked
//! token is returned to rotation at once. Blacklisted tokens never come back.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use common::Secret;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::classify::Classification;
use crate::error::{Error, Result};
use crate::ledger::{BlacklistLedger, BlacklistRecord, RedactedToken};

/// Reason stored in the ledger for 401/403 rejections.
pub const AUTH_FAILED_REASON: &str = "auth_failed";

/// Runtime status of a pooled token.
///
/// Transitions:
/// - Available → TemporarilyFailed (429, 5xx, timeout, network error)
/// - TemporarilyFailed → Available (every non-blacklisted token parked)
/// - Available | TemporarilyFailed → Blacklisted (401/403), terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    Available,
    TemporarilyFailed,
    Blacklisted,
}

impl TokenStatus {
    /// Name used in transition logs and the `to` metric label; matches the
    /// serialized form.
    pub fn label(&self) -> &'static str {
        match self {
            TokenStatus::Available => "available",
            TokenStatus::TemporarilyFailed => "temporarily_failed",
            TokenStatus::Blacklisted => "blacklisted",
        }
    }
}

struct TokenEntry {
    value: String,
    status: TokenStatus,
    failure_count: u32,
    last_used_at: Option<u64>,
}

/// A token handed out by `acquire`, ready to attach to one upstream call.
///
/// Not exclusive: concurrent requests may hold the same token.
#[derive(Debug, Clone)]
pub struct AcquiredToken {
    token: Secret<String>,
    position: usize,
}

impl AcquiredToken {
    /// Raw token value for the upstream request.
    pub fn value(&self) -> &str {
        self.token.expose()
    }

    /// Prefix-only form for logs.
    pub fn redacted(&self) -> String {
        self.token.redacted()
    }

    /// Index of the token in load order.
    pub fn position(&self) -> usize {
        self.position
    }
}

/// Snapshot of token counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub available: usize,
    pub temporarily_failed: usize,
    pub blacklisted: usize,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total={} available={} temporarily_failed={} blacklisted={}",
            self.total, self.available, self.temporarily_failed, self.blacklisted
        )
    }
}

/// Per-token operator view. Never carries the full token.
#[derive(Debug, Clone, Serialize)]
pub struct TokenView {
    #[serde(flatten)]
    pub token: RedactedToken,
    pub status: TokenStatus,
    pub failure_count: u32,
    /// Unix timestamp in milliseconds of the last acquisition
    pub last_used_at: Option<u64>,
}

struct PoolState {
    tokens: Vec<TokenEntry>,
    positions: HashMap<String, usize>,
    cursor: usize,
}

impl PoolState {
    /// Next available token at or after the cursor. Moves the cursor past the
    /// selected token, scanning at most one full pass.
    fn select_next(&mut self) -> Option<AcquiredToken> {
        let n = self.tokens.len();
        for offset in 0..n {
            let idx = (self.cursor + offset) % n;
            let entry = &mut self.tokens[idx];
            if entry.status == TokenStatus::Available {
                entry.last_used_at = Some(now_millis());
                self.cursor = (idx + 1) % n;
                return Some(AcquiredToken {
                    token: Secret::new(entry.value.clone()),
                    position: idx,
                });
            }
        }
        None
    }

    /// Return every parked token to rotation once none is available.
    /// Returns how many tokens were reset.
    fn reset_if_exhausted(&mut self) -> usize {
        let stats = self.stats();
        if stats.available > 0 || stats.temporarily_failed == 0 {
            return 0;
        }
        for entry in &mut self.tokens {
            if entry.status == TokenStatus::TemporarilyFailed {
                entry.status = TokenStatus::Available;
            }
        }
        warn!(
            reset = stats.temporarily_failed,
            blacklisted = stats.blacklisted,
            "all tokens temporarily failed, returning them to rotation"
        );
        metrics::counter!("proxy_token_transitions_total", "to" => "reset")
            .increment(stats.temporarily_failed as u64);
        stats.temporarily_failed
    }

    fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            total: self.tokens.len(),
            ..PoolStats::default()
        };
        for entry in &self.tokens {
            match entry.status {
                TokenStatus::Available => stats.available += 1,
                TokenStatus::TemporarilyFailed => stats.temporarily_failed += 1,
                TokenStatus::Blacklisted => stats.blacklisted += 1,
            }
        }
        stats
    }
}

/// Round-robin pool over upstream tokens.
pub struct TokenPool {
    state: Mutex<PoolState>,
    ledger: Arc<BlacklistLedger>,
}

impl TokenPool {
    /// Build the pool from tokens in load order.
    ///
    /// Tokens already present in the ledger start out blacklisted. Duplicates
    /// keep their first position. An empty token list is a configuration
    /// error; a list where every token is already blacklisted is allowed and
    /// every request will fail with `Exhausted`.
    pub async fn new(tokens: Vec<String>, ledger: Arc<BlacklistLedger>) -> Result<Self> {
        if tokens.is_empty() {
            return Err(Error::NoTokens);
        }

        let blacklisted = ledger.tokens().await;
        let mut entries: Vec<TokenEntry> = Vec::with_capacity(tokens.len());
        let mut positions = HashMap::with_capacity(tokens.len());
        for value in tokens {
            if positions.contains_key(&value) {
                continue;
            }
            let status = if blacklisted.contains(&value) {
                TokenStatus::Blacklisted
            } else {
                TokenStatus::Available
            };
            positions.insert(value.clone(), entries.len());
            entries.push(TokenEntry {
                value,
                status,
                failure_count: 0,
                last_used_at: None,
            });
        }

        let state = PoolState {
            tokens: entries,
            positions,
            cursor: 0,
        };
        let stats = state.stats();
        if stats.available == 0 {
            warn!(%stats, "every loaded token is blacklisted, requests will fail");
        }
        info!(%stats, "token pool initialized");

        Ok(Self {
            state: Mutex::new(state),
            ledger,
        })
    }

    /// Hand out the next available token round-robin.
    ///
    /// Returns `Exhausted` when no token is available after the exhaustion
    /// reset has been applied. Never waits for a token to recover.
    pub async fn acquire(&self) -> Result<AcquiredToken> {
        let mut state = self.state.lock().await;
        if let Some(token) = state.select_next() {
            debug!(token = %token.redacted(), position = token.position(), "token acquired");
            return Ok(token);
        }
        if state.reset_if_exhausted() > 0
            && let Some(token) = state.select_next()
        {
            return Ok(token);
        }
        Err(Error::Exhausted {
            stats: state.stats(),
        })
    }

    /// Park a token after a transient rejection.
    ///
    /// No effect on blacklisted or unknown tokens. Parking the last available
    /// token resets every parked token.
    pub async fn report_temporary_failure(&self, token: &str) {
        let mut state = self.state.lock().await;
        let Some(&idx) = state.positions.get(token) else {
            warn!(token = %common::redact(token), "temporary failure reported for unknown token");
            return;
        };

        let entry = &mut state.tokens[idx];
        match entry.status {
            TokenStatus::Blacklisted => {
                debug!(token = %common::redact(token), "token already blacklisted, ignoring temporary failure");
                return;
            }
            TokenStatus::Available => {
                entry.status = TokenStatus::TemporarilyFailed;
                entry.failure_count += 1;
                warn!(
                    token = %common::redact(token),
                    from = TokenStatus::Available.label(),
                    status = entry.status.label(),
                    failure_count = entry.failure_count,
                    "token temporarily failed"
                );
                metrics::counter!("proxy_token_transitions_total", "to" => entry.status.label())
                    .increment(1);
            }
            TokenStatus::TemporarilyFailed => {
                entry.failure_count += 1;
            }
        }

        state.reset_if_exhausted();
    }

    /// Permanently retire a token and persist it to the ledger.
    ///
    /// The in-memory transition is applied before the ledger write, so the
    /// token is out of rotation even if persistence fails; the persistence
    /// error is returned to the caller. Re-blacklisting is a no-op.
    pub async fn report_blacklist(&self, token: &str, reason: &str) -> Result<()> {
        let previous = {
            let mut state = self.state.lock().await;
            let Some(&idx) = state.positions.get(token) else {
                warn!(token = %common::redact(token), "blacklist reported for unknown token");
                return Ok(());
            };
            let entry = &mut state.tokens[idx];
            let previous = entry.status;
            if previous != TokenStatus::Blacklisted {
                entry.status = TokenStatus::Blacklisted;
                entry.failure_count += 1;
                state.reset_if_exhausted();
            }
            previous
        };

        if previous == TokenStatus::Blacklisted {
            debug!(token = %common::redact(token), "token already blacklisted");
            return Ok(());
        }

        metrics::counter!("proxy_token_transitions_total", "to" => TokenStatus::Blacklisted.label())
            .increment(1);
        let persisted = self
            .ledger
            .append(BlacklistRecord::new(token, reason))
            .await?;
        let total = self.ledger.len().await;
        warn!(
            token = %common::redact(token),
            from = previous.label(),
            reason,
            persisted,
            total_blacklisted = total,
            "token permanently blacklisted"
        );
        Ok(())
    }

    /// Apply the pool action for a classified upstream outcome.
    pub async fn report_outcome(
        &self,
        token: &AcquiredToken,
        classification: Classification,
    ) -> Result<()> {
        match classification {
            Classification::AuthFailure => {
                self.report_blacklist(token.value(), AUTH_FAILED_REASON)
                    .await
            }
            Classification::RateLimited | Classification::Transient => {
                self.report_temporary_failure(token.value()).await;
                Ok(())
            }
            Classification::Success | Classification::ClientError => Ok(()),
        }
    }

    /// Counts by status.
    pub async fn stats(&self) -> PoolStats {
        self.state.lock().await.stats()
    }

    /// Per-token redacted view in load order.
    pub async fn tokens(&self) -> Vec<TokenView> {
        let state = self.state.lock().await;
        state
            .tokens
            .iter()
            .map(|entry| TokenView {
                token: RedactedToken::from_token(&entry.value),
                status: entry.status,
                failure_count: entry.failure_count,
                last_used_at: entry.last_used_at,
            })
            .collect()
    }

    /// Pool health label: all available → healthy, some → degraded,
    /// none → unhealthy.
    pub async fn health(&self) -> &'static str {
        let stats = self.stats().await;
        if stats.total > 0 && stats.available == stats.total {
            "healthy"
        } else if stats.available > 0 || stats.temporarily_failed > 0 {
            "degraded"
        } else {
            "unhealthy"
        }
    }

    pub fn ledger(&self) -> &Arc<BlacklistLedger> {
        &self.ledger
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    async fn test_ledger(dir: &tempfile::TempDir) -> Arc<BlacklistLedger> {
        Arc::new(
            BlacklistLedger::load(dir.path().join("blacklist.jsonl"))
                .await
                .unwrap(),
        )
    }

    fn tokens(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    async fn test_pool(dir: &tempfile::TempDir, values: &[&str]) -> TokenPool {
        TokenPool::new(tokens(values), test_ledger(dir).await)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn round_robin_cycles_through_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &["sk-a", "sk-b"]).await;

        let t1 = pool.acquire().await.unwrap();
        let t2 = pool.acquire().await.unwrap();
        let t3 = pool.acquire().await.unwrap();

        assert_eq!(t1.value(), "sk-a");
        assert_eq!(t2.value(), "sk-b");
        assert_eq!(t3.value(), "sk-a");
    }

    #[tokio::test]
    async fn full_pass_returns_each_token_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let values = ["sk-1", "sk-2", "sk-3", "sk-4", "sk-5"];
        let pool = test_pool(&dir, &values).await;

        let mut seen = HashSet::new();
        for _ in 0..values.len() {
            let token = pool.acquire().await.unwrap();
            assert!(seen.insert(token.value().to_string()), "repeat before full pass");
        }
        assert_eq!(seen.len(), values.len());
    }

    #[tokio::test]
    async fn skipping_a_parked_token_does_not_repeat_the_next_one() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &["sk-a", "sk-b", "sk-c"]).await;

        pool.report_temporary_failure("sk-a").await;

        let t1 = pool.acquire().await.unwrap();
        let t2 = pool.acquire().await.unwrap();
        assert_eq!(t1.value(), "sk-b");
        assert_eq!(t2.value(), "sk-c");
    }

    #[tokio::test]
    async fn temporary_failure_is_skipped_until_reset() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &["sk-a", "sk-b", "sk-c"]).await;

        pool.report_temporary_failure("sk-b").await;

        for _ in 0..6 {
            assert_ne!(pool.acquire().await.unwrap().value(), "sk-b");
        }
        let stats = pool.stats().await;
        assert_eq!(stats.temporarily_failed, 1);
        assert_eq!(stats.available, 2);
    }

    #[tokio::test]
    async fn exhaustion_resets_parked_tokens_but_not_blacklisted() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &["sk-a", "sk-b", "sk-c"]).await;

        pool.report_blacklist("sk-a", AUTH_FAILED_REASON).await.unwrap();
        pool.report_temporary_failure("sk-b").await;
        pool.report_temporary_failure("sk-c").await;

        let stats = pool.stats().await;
        assert_eq!(stats.available, 2, "parked tokens return when none is left");
        assert_eq!(stats.temporarily_failed, 0);
        assert_eq!(stats.blacklisted, 1);

        let token = pool.acquire().await.unwrap();
        assert_ne!(token.value(), "sk-a");
        for _ in 0..4 {
            assert_ne!(pool.acquire().await.unwrap().value(), "sk-a");
        }
    }

    #[tokio::test]
    async fn blacklisting_last_available_resets_parked_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &["sk-a", "sk-b"]).await;

        pool.report_temporary_failure("sk-a").await;
        pool.report_blacklist("sk-b", AUTH_FAILED_REASON).await.unwrap();

        assert_eq!(pool.acquire().await.unwrap().value(), "sk-a");
    }

    #[tokio::test]
    async fn blacklisted_token_is_never_acquired_again() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &["sk-a", "sk-b"]).await;

        pool.report_blacklist("sk-a", AUTH_FAILED_REASON).await.unwrap();

        for _ in 0..5 {
            assert_eq!(pool.acquire().await.unwrap().value(), "sk-b");
        }
        pool.report_temporary_failure("sk-a").await;
        let stats = pool.stats().await;
        assert_eq!(stats.blacklisted, 1);
        assert_eq!(stats.temporarily_failed, 0);
    }

    #[tokio::test]
    async fn blacklist_survives_reload_from_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &["sk-a", "sk-b"]).await;
        pool.report_blacklist("sk-a", AUTH_FAILED_REASON).await.unwrap();
        drop(pool);

        let reloaded = test_pool(&dir, &["sk-a", "sk-b"]).await;
        let stats = reloaded.stats().await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.blacklisted, 1);
        for _ in 0..4 {
            assert_eq!(reloaded.acquire().await.unwrap().value(), "sk-b");
        }
    }

    #[tokio::test]
    async fn reblacklisting_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &["sk-a", "sk-b"]).await;

        pool.report_blacklist("sk-a", AUTH_FAILED_REASON).await.unwrap();
        pool.report_blacklist("sk-a", "again").await.unwrap();

        assert_eq!(pool.ledger().len().await, 1);
        let view = pool.tokens().await;
        assert_eq!(view[0].failure_count, 1);
    }

    #[tokio::test]
    async fn all_blacklisted_returns_exhausted_with_counts() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &["sk-a", "sk-b"]).await;

        pool.report_blacklist("sk-a", AUTH_FAILED_REASON).await.unwrap();
        pool.report_blacklist("sk-b", AUTH_FAILED_REASON).await.unwrap();

        match pool.acquire().await {
            Err(Error::Exhausted { stats }) => {
                assert_eq!(stats.total, 2);
                assert_eq!(stats.available, 0);
                assert_eq!(stats.blacklisted, 2);
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_token_list_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = TokenPool::new(Vec::new(), test_ledger(&dir).await).await;
        assert!(matches!(result, Err(Error::NoTokens)));
    }

    #[tokio::test]
    async fn all_tokens_preblacklisted_still_builds() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = test_ledger(&dir).await;
        ledger
            .append(BlacklistRecord::new("sk-a", AUTH_FAILED_REASON))
            .await
            .unwrap();

        let pool = TokenPool::new(tokens(&["sk-a"]), ledger).await.unwrap();
        assert!(matches!(pool.acquire().await, Err(Error::Exhausted { .. })));
        assert_eq!(pool.health().await, "unhealthy");
    }

    #[tokio::test]
    async fn duplicate_tokens_are_pooled_once() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &["sk-a", "sk-b", "sk-a"]).await;
        assert_eq!(pool.stats().await.total, 2);
    }

    #[tokio::test]
    async fn report_outcome_dispatches_by_classification() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &["sk-a", "sk-b", "sk-c", "sk-d"]).await;

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let c = pool.acquire().await.unwrap();
        let d = pool.acquire().await.unwrap();

        pool.report_outcome(&a, Classification::AuthFailure).await.unwrap();
        pool.report_outcome(&b, Classification::RateLimited).await.unwrap();
        pool.report_outcome(&c, Classification::ClientError).await.unwrap();
        pool.report_outcome(&d, Classification::Success).await.unwrap();

        let view = pool.tokens().await;
        assert_eq!(view[0].status, TokenStatus::Blacklisted);
        assert_eq!(view[1].status, TokenStatus::TemporarilyFailed);
        assert_eq!(view[2].status, TokenStatus::Available);
        assert_eq!(view[3].status, TokenStatus::Available);
    }

    #[tokio::test]
    async fn concurrent_acquire_spreads_across_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(test_pool(&dir, &["sk-1", "sk-2", "sk-3", "sk-4"]).await);

        let mut handles = vec![];
        for _ in 0..8 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                pool.acquire().await.unwrap().value().to_string()
            }));
        }
        let mut counts: HashMap<String, usize> = HashMap::new();
        for h in handles {
            *counts.entry(h.await.unwrap()).or_default() += 1;
        }
        assert_eq!(counts.len(), 4);
        assert!(counts.values().all(|&c| c == 2), "uneven rotation: {counts:?}");
    }

    #[tokio::test]
    async fn token_view_is_redacted_and_tracks_usage() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &["sk-live-0123456789abcdef"]).await;

        assert!(pool.tokens().await[0].last_used_at.is_none());
        pool.acquire().await.unwrap();

        let view = pool.tokens().await;
        assert_eq!(view[0].token.token_prefix, "sk-live-01");
        assert_eq!(view[0].token.token_length, 24);
        assert!(view[0].last_used_at.is_some());

        let json = serde_json::to_value(&view[0]).unwrap();
        assert_eq!(json["token_prefix"], "sk-live-01");
        assert_eq!(json["status"], "available");
        assert!(!json.to_string().contains("sk-live-0123456789abcdef"));
    }

    #[tokio::test]
    async fn health_reflects_availability() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(&dir, &["sk-a", "sk-b"]).await;
        assert_eq!(pool.health().await, "healthy");

        pool.report_temporary_failure("sk-a").await;
        assert_eq!(pool.health().await, "degraded");

        pool.report_blacklist("sk-a", AUTH_FAILED_REASON).await.unwrap();
        pool.report_blacklist("sk-b", AUTH_FAILED_REASON).await.unwrap();
        assert_eq!(pool.health().await, "unhealthy");
    }

    #[test]
    fn status_label_matches_serialized_name() {
        for status in [
            TokenStatus::Available,
            TokenStatus::TemporarilyFailed,
            TokenStatus::Blacklisted,
        ] {
            let serialized = serde_json::to_value(status).unwrap();
            assert_eq!(serialized, status.label());
        }
    }

    #[test]
    fn acquired_token_debug_is_redacted() {
        let token = AcquiredToken {
            token: Secret::new("sk-live-secret".to_string()),
            position: 0,
        };
        assert!(!format!("{token:?}").contains("sk-live-secret"));
        assert_eq!(token.redacted(), "sk-live-se...");
    }
}
