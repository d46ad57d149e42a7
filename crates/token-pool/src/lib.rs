//! Rotating pool of upstream API tokens
//!
//! Spreads upstream calls across a set of tokens loaded from a flat credential
//! file, parks tokens that hit transient rejections, and permanently retires
//! tokens the upstream refuses to authenticate. Retired tokens are written to a
//! blacklist ledger so they stay out of rotation across restarts.
//!
//! Token lifecycle:
//! 1. `CredentialStore` reads `username|password|token` lines at startup
//! 2. `TokenPool::new` merges them with the `BlacklistLedger`
//! 3. `TokenPool::acquire` hands out the next available token round-robin
//! 4. Upstream returns 429/5xx/timeout → `TemporarilyFailed`
//! 5. Every token temporarily failed → all reset to `Available`
//! 6. Upstream returns 401/403 → `Blacklisted`, persisted, never reversed

pub mod classify;
pub mod credentials;
pub mod error;
pub mod ledger;
pub mod pool;

pub use classify::{Classification, classify_status};
pub use credentials::{CredentialRecord, CredentialStore};
pub use error::{Error, Result};
pub use ledger::{BlacklistLedger, BlacklistRecord, RedactedToken};
pub use pool::{AcquiredToken, PoolStats, TokenPool, TokenStatus, TokenView};
