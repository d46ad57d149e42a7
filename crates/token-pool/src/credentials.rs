//! Flat-file credential loading
//!
//! The account file holds one `username|password|token` record per line.
//! The token is the last field, so a password may itself contain `|`.
//! Only the token is used for upstream calls; username and password are kept
//! opaque. Blank lines and malformed lines are skipped with a warning that
//! names the line number but never the token itself.

use std::fmt;
use std::path::{Path, PathBuf};

use common::Secret;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// One parsed line of the account file.
pub struct CredentialRecord {
    pub username: String,
    pub password: Secret<String>,
    pub token: Secret<String>,
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("username", &self.username)
            .field("password", &self.password)
            .field("token", &self.token.redacted())
            .finish()
    }
}

/// Credentials loaded from the account file, in file order.
#[derive(Debug)]
pub struct CredentialStore {
    path: PathBuf,
    records: Vec<CredentialRecord>,
}

impl CredentialStore {
    /// Read and parse the account file.
    ///
    /// Tokens not starting with `token_prefix` are skipped; an empty prefix
    /// accepts every token. An unreadable file is an error. A readable file
    /// with no usable lines is not; the pool rejects an empty token set.
    pub async fn load(path: PathBuf, token_prefix: &str) -> Result<Self> {
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| Error::Credential(format!("reading {}: {e}", path.display())))?;

        let mut records = Vec::new();
        for (idx, line) in contents.lines().enumerate() {
            let line_number = idx + 1;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let Some(record) = parse_line(trimmed) else {
                warn!(line = line_number, "skipping malformed credential line");
                continue;
            };
            if !record.token.expose().starts_with(token_prefix) {
                warn!(
                    line = line_number,
                    token = %record.token.redacted(),
                    expected_prefix = token_prefix,
                    "skipping token with unexpected prefix"
                );
                continue;
            }
            records.push(record);
        }

        info!(path = %path.display(), records = records.len(), "loaded credentials");
        Ok(Self { path, records })
    }

    /// Distinct tokens in file order. A repeated token keeps the position of
    /// its first occurrence.
    pub fn tokens(&self) -> Vec<String> {
        let mut tokens: Vec<String> = Vec::with_capacity(self.records.len());
        for record in &self.records {
            let token = record.token.expose();
            if !tokens.iter().any(|t| t == token) {
                tokens.push(token.clone());
            }
        }
        tokens
    }

    pub fn records(&self) -> &[CredentialRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Parse `username|password|token`. At least three fields: the first is the
/// username, the last the token, and everything between is the password.
fn parse_line(line: &str) -> Option<CredentialRecord> {
    let (username, rest) = line.split_once('|')?;
    let (password, token) = rest.rsplit_once('|')?;
    let token = token.trim();
    if token.is_empty() {
        return None;
    }
    Some(CredentialRecord {
        username: username.trim().to_string(),
        password: Secret::new(password.to_string()),
        token: Secret::new(token.to_string()),
    })
}
