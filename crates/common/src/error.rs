//! Configuration-time error types

use thiserror::Error;

/// Errors raised while loading configuration and startup inputs.
///
/// Every variant is fatal: the proxy refuses to serve until the operator
/// fixes the underlying file or setting.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result alias using common Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display_carries_message() {
        let err = Error::Config("max_retries must be greater than 0".into());
        assert_eq!(
            err.to_string(),
            "Configuration error: max_retries must be greater than 0"
        );
    }

    #[test]
    fn io_error_converts_with_prefix() {
        let err: Error =
            std::io::Error::new(std::io::ErrorKind::NotFound, "accounts.txt").into();
        assert!(err.to_string().starts_with("I/O error:"), "got: {err}");
        assert!(format!("{err:?}").contains("Io"));
    }

    #[test]
    fn toml_error_converts() {
        let parse: std::result::Result<toml::Value, _> = toml::from_str("[proxy\nbroken");
        let err: Error = parse.unwrap_err().into();
        assert!(err.to_string().starts_with("TOML parse error:"), "got: {err}");
    }
}
