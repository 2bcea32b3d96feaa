//! Configuration errors.

use thiserror::Error;

/// Errors raised while loading or validating configuration.
///
/// All of these are fatal at boot.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file exists but could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The config file is not valid TOML.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// An environment variable override could not be interpreted.
    #[error("invalid environment override {name}: {message}")]
    Env {
        /// The variable name.
        name: String,
        /// Why it was rejected.
        message: String,
    },

    /// A semantic validation failure.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
