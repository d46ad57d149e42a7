//! Configuration types and loading
//!
//! Precedence: CLI `--config` > `CONFIG_PATH` env var > default file name for
//! locating the file, then env overlays (`MCP_LISTEN_ADDR`, `MCP_UPSTREAM_URL`,
//! `MCP_MAX_RETRIES`) on top of file values, then built-in defaults. Every
//! field has a default so an absent default config file is not an error.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name used when neither `--config` nor `CONFIG_PATH` is given.
pub const DEFAULT_CONFIG_PATH: &str = "mcp-token-proxy.toml";

/// Root configuration
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub tokens: TokensConfig,
}

/// HTTP proxy and retry settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub upstream_url: String,
    /// Query parameter that carries the upstream token.
    pub token_param: String,
    pub timeout_secs: u64,
    pub max_connections: usize,
    /// Total upstream attempts per request, first try included.
    pub max_retries: u32,
    /// Pause before retrying after a 429.
    pub rate_limit_backoff_ms: u64,
    /// Pause before retrying after a 5xx.
    pub server_error_backoff_ms: u64,
    /// Pause before retrying after a timeout or transport error.
    pub network_error_backoff_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            upstream_url: "https://ai.variflight.com/servers/aviation/mcp/".into(),
            token_param: "api_key".into(),
            timeout_secs: 300,
            max_connections: 100,
            max_retries: 3,
            rate_limit_backoff_ms: 1000,
            server_error_backoff_ms: 500,
            network_error_backoff_ms: 1000,
        }
    }
}

impl ProxyConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_backoff(&self) -> RetryBackoff {
        RetryBackoff {
            rate_limited: Duration::from_millis(self.rate_limit_backoff_ms),
            server_error: Duration::from_millis(self.server_error_backoff_ms),
            network: Duration::from_millis(self.network_error_backoff_ms),
        }
    }
}

/// Pause before the next attempt, by failure class. Auth failures retry
/// immediately with the next token.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryBackoff {
    pub rate_limited: Duration,
    pub server_error: Duration,
    pub network: Duration,
}

/// Token source and blacklist persistence
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TokensConfig {
    pub accounts_file: PathBuf,
    pub blacklist_file: PathBuf,
    /// Tokens not starting with this prefix are skipped at load time.
    pub token_prefix: String,
}

impl Default for TokensConfig {
    fn default() -> Self {
        Self {
            accounts_file: PathBuf::from("accounts.txt"),
            blacklist_file: PathBuf::from("blacklist.jsonl"),
            token_prefix: "sk-".into(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Built-in defaults with environment overlays, for running without a file.
    pub fn from_env() -> common::Result<Self> {
        let mut config = Config::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path`, falling back to defaults only when `path` is the default
    /// location and does not exist. An explicitly named file must exist.
    pub fn load_or_default(path: &Path) -> common::Result<Self> {
        if path == Path::new(DEFAULT_CONFIG_PATH) && !path.exists() {
            return Self::from_env();
        }
        Self::load(path)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from(DEFAULT_CONFIG_PATH)
    }

    fn apply_env_overrides(&mut self) -> common::Result<()> {
        if let Ok(addr) = std::env::var("MCP_LISTEN_ADDR") {
            self.proxy.listen_addr = addr.parse().map_err(|e| {
                common::Error::Config(format!("MCP_LISTEN_ADDR is not a socket address: {e}"))
            })?;
        }
        if let Ok(url) = std::env::var("MCP_UPSTREAM_URL") {
            self.proxy.upstream_url = url;
        }
        if let Ok(retries) = std::env::var("MCP_MAX_RETRIES") {
            self.proxy.max_retries = retries.parse().map_err(|e| {
                common::Error::Config(format!("MCP_MAX_RETRIES is not a number: {e}"))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> common::Result<()> {
        let proxy = &self.proxy;
        if !proxy.upstream_url.starts_with("http://") && !proxy.upstream_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "upstream_url must start with http:// or https://, got: {}",
                proxy.upstream_url
            )));
        }
        if reqwest::Url::parse(&proxy.upstream_url).is_err() {
            return Err(common::Error::Config(format!(
                "upstream_url is not a valid URL: {}",
                proxy.upstream_url
            )));
        }
        if proxy.token_param.trim().is_empty() {
            return Err(common::Error::Config("token_param must not be empty".into()));
        }
        if proxy.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }
        if proxy.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }
        if proxy.max_retries == 0 {
            return Err(common::Error::Config(
                "max_retries must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
