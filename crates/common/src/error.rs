//! Configuration-level error types

use thiserror::Error;

/// Errors raised while loading or validating configuration
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
    fn config_error_display() {
        let err = Error::Config("base_url must start with http:// or https://".into());
        assert_eq!(
            err.to_string(),
            "Configuration error: base_url must start with http:// or https://"
        );
    }

    #[test]
    fn toml_error_converts() {
        let parse: std::result::Result<toml::Value, _> = toml::from_str("[api\nbase_url = 1");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Toml(_)), "got: {err:?}");
        assert!(err.to_string().starts_with("TOML parse error:"));
    }
}
