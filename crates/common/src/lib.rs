//! Shared types for the MCP token-pool proxy workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::{REDACTED_PREFIX_LEN, Secret, redact};
