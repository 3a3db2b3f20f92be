//! Error types for sm-core
//!
//! A single error enum shared by the cache, pager, prefetcher and transfer
//! queue. Store adapters map their SDK errors onto these variants.

use thiserror::Error;

/// Result type alias using the crate error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the core and by `ObjectStore` implementations
#[derive(Debug, Error)]
pub enum Error {
    /// Network or remote store failure
    #[error("Network error: {0}")]
    Network(String),

    /// Local I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Bucket or object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Credentials were rejected
    #[error("Access denied: {0}")]
    Auth(String),

    /// Malformed key, prefix or local path
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Invalid configuration value or file
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation is not valid for the current state of its target
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The operation observed a cancellation signal
    #[error("Operation canceled")]
    Cancelled,

    /// Anything else
    #[error("{0}")]
    General(String),
}

impl Error {
    /// True when the error is the normal outcome of a cancellation request
    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Cancelled => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::Interrupted,
            _ => false,
        }
    }

    /// True for network and local I/O failures.
    ///
    /// Transient errors are reported, never retried automatically.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Network(_) => true,
            Error::Io(_) => !self.is_cancelled(),
            _ => false,
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}
