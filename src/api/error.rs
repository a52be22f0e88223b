//! Error types for the library API.
//!
//! Only chain definitions, configuration and continuation backends produce
//! errors. Anything that goes wrong while a chain runs is reported through
//! [`crate::StepResult`] and [`crate::RunResult`] instead.

use thiserror::Error;

/// Errors in a chain definition.
#[derive(Error, Debug)]
pub enum ChainError {
    /// The chain file is not valid YAML or uses an unknown step type.
    #[error("Invalid chain definition: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The chain JSON is invalid or uses an unknown step type.
    #[error("Invalid chain definition: {0}")]
    Json(#[from] serde_json::Error),

    /// The chain parsed but is structurally unusable.
    #[error("Invalid chain: {0}")]
    Invalid(String),

    /// The chain file could not be read.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by continuation backends.
#[derive(Error, Debug)]
pub enum StoreError {
    /// An underlying file I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A sealing operation (encryption/decryption) failed.
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Failed to serialize or deserialize a record.
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// The backend rejected the operation.
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Errors loading the engine configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unable to determine HOME directory")]
    NoHome,

    #[error("Failed to read config.toml: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config.toml: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid provider '{0}' in config.toml")]
    UnknownProvider(String),

    #[error("Unable to open continuation store: {0}")]
    Store(String),
}
