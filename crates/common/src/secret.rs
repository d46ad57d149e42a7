//! Redaction helpers for upstream credentials

use std::fmt;
use zeroize::Zeroize;

/// Number of leading characters of a credential that may appear in logs and
/// operator views.
pub const REDACTED_PREFIX_LEN: usize = 10;

/// Sensitive value, printed as `[REDACTED]` by Debug and Display.
///
/// The inner value is zeroed on drop.
pub struct Secret<T: Zeroize>(T);

impl<T: Zeroize> Secret<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Expose the inner value (use sparingly)
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl Secret<String> {
    /// Loggable form: the first `REDACTED_PREFIX_LEN` characters plus `...`.
    pub fn redacted(&self) -> String {
        redact(&self.0)
    }
}

impl<T: Zeroize> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> Drop for Secret<T> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<T: Zeroize + Clone> Clone for Secret<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

/// Redact a credential for logging. Counts characters, not bytes, so a
/// multi-byte token never splits mid-codepoint.
pub fn redact(value: &str) -> String {
    let prefix: String = value.chars().take(REDACTED_PREFIX_LEN).collect();
    format!("{prefix}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_and_display_are_redacted() {
        let secret = Secret::new(String::from("sk-live-abcdef0123456789"));
        assert_eq!(format!("{secret:?}"), "[REDACTED]");
        assert_eq!(format!("{secret}"), "[REDACTED]");
    }

    #[test]
    fn expose_returns_inner_value() {
        let secret = Secret::new(String::from("sk-live-abcdef"));
        assert_eq!(secret.expose(), "sk-live-abcdef");
    }

    #[test]
    fn redacted_keeps_only_prefix() {
        let secret = Secret::new(String::from("sk-live-abcdef0123456789"));
        assert_eq!(secret.redacted(), "sk-live-ab...");
    }

    #[test]
    fn redact_short_value_is_whole_value_plus_ellipsis() {
        assert_eq!(redact("sk-1"), "sk-1...");
        assert_eq!(redact(""), "...");
    }

    #[test]
    fn redact_respects_char_boundaries() {
        assert_eq!(redact("ééééééééééééé"), "éééééééééé...");
    }
}
