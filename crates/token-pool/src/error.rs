//! Error types for pool operations

use crate::pool::PoolStats;

/// Errors from pool, ledger, and credential operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No token is currently available. Transient: later requests may succeed
    /// once a temporary failure resets.
    #[error("no available tokens ({stats})")]
    Exhausted { stats: PoolStats },

    /// The credential file produced zero tokens. Fatal at startup.
    #[error("no usable tokens loaded")]
    NoTokens,

    #[error("credential file error: {0}")]
    Credential(String),

    #[error("blacklist ledger error: {0}")]
    Ledger(String),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
