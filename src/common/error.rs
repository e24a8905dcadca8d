//! Error types for ringroute

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === Routing Errors ===
    #[error("No servers registered on the hash ring")]
    EmptyRing,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // === Coordination Store Errors ===
    #[error("Coordination store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    ///
    /// Informational only: the routers never retry on their own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_) | Error::Timeout(_))
    }

    /// Did this error originate in the coordination store?
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            Error::StoreUnavailable(_) | Error::Timeout(_) | Error::Serialization(_)
        )
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}
