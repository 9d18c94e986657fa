//! Redacting wrapper for bearer credentials and other sensitive strings

use std::fmt;
use zeroize::Zeroize;

/// Sensitive value - redacted in Debug/Display/logs, zeroized on drop
pub struct Secret<T: Zeroize>(T);

impl<T: Zeroize> Secret<T> {
    /// Wrap a sensitive value
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Expose the inner value (use sparingly, never in log fields)
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl Secret<String> {
    /// Wrap a string, trimming it. Blank input yields `None` so callers never
    /// carry an empty credential around.
    pub fn non_blank(value: impl AsRef<str>) -> Option<Self> {
        let trimmed = value.as_ref().trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_owned()))
        }
    }

    /// Read an environment variable as a secret, ignoring unset or blank values.
    pub fn from_env(key: &str) -> Option<Self> {
        std::env::var(key).ok().and_then(Self::non_blank)
    }

    /// Borrow the inner string.
    pub fn expose_str(&self) -> &str {
        self.0.as_str()
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
