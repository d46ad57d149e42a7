//! Upstream outcome classification
//!
//! Maps an upstream HTTP status to the pool action and retry decision for the
//! token that produced it. Network errors and timeouts never reach this
//! function; callers classify them as `Transient` directly.

/// How an upstream outcome affects the token that was used and the request.
///
/// - `Success`: return the response, no pool action
/// - `AuthFailure`: blacklist the token, retry with another
/// - `RateLimited`: park the token, retry with another
/// - `Transient`: park the token, retry while attempts remain
/// - `ClientError`: not a token problem, return the response unchanged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Success,
    AuthFailure,
    RateLimited,
    Transient,
    ClientError,
}

impl Classification {
    /// Whether the request should be retried with a different token.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Classification::AuthFailure | Classification::RateLimited | Classification::Transient
        )
    }

    /// Label for logs and metrics.
    pub fn label(self) -> &'static str {
        match self {
            Classification::Success => "success",
            Classification::AuthFailure => "auth_failure",
            Classification::RateLimited => "rate_limited",
            Classification::Transient => "transient",
            Classification::ClientError => "client_error",
        }
    }
}

/// Classify an upstream response by HTTP status.
///
/// 2xx and 3xx are successes. 401/403 mean the token was rejected, 429 means
/// it is over quota for now, 5xx is an upstream fault. Any other 4xx is the
/// client's problem and passes through.
pub fn classify_status(status: u16) -> Classification {
    match status {
        200..=399 => Classification::Success,
        401 | 403 => Classification::AuthFailure,
        429 => Classification::RateLimited,
        400..=499 => Classification::ClientError,
        _ => Classification::Transient,
    }
}
