//! Error handling for tlsgate
//!
//! This module defines the application-wide error types and result type.
//! Only startup failures travel through [`Error`]; per-connection failures
//! are handled inside the connection task (see `router::connection`).

use thiserror::Error;

/// Application-wide result type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for tlsgate
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Listening socket could not be bound
    #[error("Listen error: {0}")]
    Listen(String),

    /// Certificate or private key could not be loaded
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Generic errors
    #[error("Error: {0}")]
    Generic(String),
}

impl Error {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new listen error
    pub fn listen(msg: impl Into<String>) -> Self {
        Error::Listen(msg.into())
    }

    /// Create a new certificate error
    pub fn certificate(msg: impl Into<String>) -> Self {
        Error::Certificate(msg.into())
    }

    /// Create a new generic error
    pub fn generic(msg: impl Into<String>) -> Self {
        Error::Generic(msg.into())
    }

    /// Whether the error belongs to the configuration class (bad config,
    /// unreadable certificates, conflicting routes).
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::Certificate(_) | Error::Json(_) | Error::Toml(_)
        )
    }
}

/// Convert from anyhow::Error
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Generic(err.to_string())
    }
}
