//! Persistent blacklist of permanently rejected tokens
//!
//! On-disk format (version 1) is JSON Lines. The first line is a header, each
//! following line is one record:
//!
//! ```text
//! {"format":"mcp-token-blacklist","version":1}
//! {"token":"sk-...","blacklisted_at":1735500000000,"reason":"auth_failed"}
//! ```
//!
//! `blacklisted_at` is a unix timestamp in milliseconds. Every append rewrites
//! the whole file through a temp file, `fsync`, and rename, so a crash leaves
//! either the old file or the new one. Lines that fail to parse are skipped on
//! load without discarding the rest.
//!
//! A tokio Mutex serializes writers. Readers only take the records lock, so
//! `preview` never waits on disk I/O.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Value of the header `format` field.
pub const LEDGER_FORMAT: &str = "mcp-token-blacklist";

/// Current on-disk format version.
pub const LEDGER_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct LedgerHeader {
    format: String,
    version: u32,
}

/// A permanently blacklisted token.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlacklistRecord {
    pub token: String,
    /// Unix timestamp in milliseconds
    pub blacklisted_at: u64,
    pub reason: String,
}

impl BlacklistRecord {
    /// Record stamped with the current time.
    pub fn new(token: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            blacklisted_at: now_millis(),
            reason: reason.into(),
        }
    }
}

impl fmt::Debug for BlacklistRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlacklistRecord")
            .field("token", &common::redact(&self.token))
            .field("blacklisted_at", &self.blacklisted_at)
            .field("reason", &self.reason)
            .finish()
    }
}

/// Operator-safe view of a token: fixed-length prefix plus total length.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RedactedToken {
    pub token_prefix: String,
    pub token_length: usize,
}

impl RedactedToken {
    pub fn from_token(token: &str) -> Self {
        Self {
            token_prefix: token.chars().take(common::REDACTED_PREFIX_LEN).collect(),
            token_length: token.chars().count(),
        }
    }
}

/// Blacklist file manager.
pub struct BlacklistLedger {
    path: PathBuf,
    records: RwLock<Vec<BlacklistRecord>>,
    write_lock: Mutex<()>,
}

impl BlacklistLedger {
    /// Load the ledger from `path`.
    ///
    /// A missing file is created empty (header only) so an unwritable
    /// location fails at startup instead of at the first blacklisting.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let records = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Ledger(format!("reading {}: {e}", path.display())))?;
            let records = parse_ledger(&contents)?;
            info!(path = %path.display(), blacklisted = records.len(), "loaded blacklist ledger");
            records
        } else {
            info!(path = %path.display(), "blacklist ledger not found, starting empty");
            write_atomic(&path, &[]).await?;
            Vec::new()
        };

        Ok(Self {
            path,
            records: RwLock::new(records),
            write_lock: Mutex::new(()),
        })
    }

    /// Set of every blacklisted token string.
    pub async fn tokens(&self) -> HashSet<String> {
        self.records
            .read()
            .await
            .iter()
            .map(|r| r.token.clone())
            .collect()
    }

    pub async fn contains(&self, token: &str) -> bool {
        self.records.read().await.iter().any(|r| r.token == token)
    }

    /// Persist a record. Returns `false` without touching disk when the token
    /// is already blacklisted.
    ///
    /// The record becomes visible to readers only after the file has been
    /// durably replaced.
    pub async fn append(&self, record: BlacklistRecord) -> Result<bool> {
        let _writer = self.write_lock.lock().await;

        let mut snapshot = self.records.read().await.clone();
        if snapshot.iter().any(|r| r.token == record.token) {
            debug!(token = %common::redact(&record.token), "token already in ledger");
            return Ok(false);
        }
        snapshot.push(record.clone());

        write_atomic(&self.path, &snapshot).await?;
        self.records.write().await.push(record);
        Ok(true)
    }

    /// First `limit` records in ledger order, redacted.
    pub async fn preview(&self, limit: usize) -> Vec<RedactedToken> {
        self.records
            .read()
            .await
            .iter()
            .take(limit)
            .map(|r| RedactedToken::from_token(&r.token))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn parse_ledger(contents: &str) -> Result<Vec<BlacklistRecord>> {
    let mut lines = contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty());

    let Some((_, header_line)) = lines.next() else {
        return Ok(Vec::new());
    };
    let header: LedgerHeader = serde_json::from_str(header_line)
        .map_err(|e| Error::Ledger(format!("invalid header: {e}")))?;
    if header.format != LEDGER_FORMAT {
        return Err(Error::Ledger(format!(
            "unexpected format {:?}, expected {LEDGER_FORMAT:?}",
            header.format
        )));
    }
    if header.version != LEDGER_VERSION {
        return Err(Error::Ledger(format!(
            "unsupported version {}, expected {LEDGER_VERSION}",
            header.version
        )));
    }

    let mut records: Vec<BlacklistRecord> = Vec::new();
    for (idx, line) in lines {
        match serde_json::from_str::<BlacklistRecord>(line) {
            Ok(record) => {
                if !records.iter().any(|r| r.token == record.token) {
                    records.push(record);
                }
            }
            Err(e) => {
                warn!(line = idx + 1, error = %e, "skipping unreadable blacklist record");
            }
        }
    }
    Ok(records)
}

fn serialize_ledger(records: &[BlacklistRecord]) -> Result<String> {
    let header = LedgerHeader {
        format: LEDGER_FORMAT.to_string(),
        version: LEDGER_VERSION,
    };
    let mut out = serde_json::to_string(&header)
        .map_err(|e| Error::Ledger(format!("serializing header: {e}")))?;
    out.push('\n');
    for record in records {
        let line = serde_json::to_string(record)
            .map_err(|e| Error::Ledger(format!("serializing record: {e}")))?;
        out.push_str(&line);
        out.push('\n');
    }
    Ok(out)
}

/// Replace the ledger file atomically.
///
/// Writes a temp file in the same directory, fsyncs it, renames it over the
/// target, then fsyncs the directory so the rename itself survives a crash.
/// Permissions are 0600 since the file holds live credentials.
async fn write_atomic(path: &Path, records: &[BlacklistRecord]) -> Result<()> {
    let contents = serialize_ledger(records)?;

    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let file_name = path
        .file_name()
        .ok_or_else(|| Error::Ledger(format!("{} has no file name", path.display())))?
        .to_string_lossy();
    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

    let mut file = tokio::fs::File::create(&tmp_path)
        .await
        .map_err(|e| Error::Ledger(format!("creating temp ledger file: {e}")))?;
    file.write_all(contents.as_bytes())
        .await
        .map_err(|e| Error::Ledger(format!("writing temp ledger file: {e}")))?;
    file.sync_all()
        .await
        .map_err(|e| Error::Ledger(format!("syncing temp ledger file: {e}")))?;
    drop(file);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Ledger(format!("setting ledger permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Ledger(format!("renaming temp ledger file: {e}")))?;

    #[cfg(unix)]
    {
        let dir_handle = tokio::fs::File::open(&dir)
            .await
            .map_err(|e| Error::Ledger(format!("opening ledger directory: {e}")))?;
        dir_handle
            .sync_all()
            .await
            .map_err(|e| Error::Ledger(format!("syncing ledger directory: {e}")))?;
    }

    debug!(path = %path.display(), records = records.len(), "persisted blacklist ledger");
    Ok(())
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
