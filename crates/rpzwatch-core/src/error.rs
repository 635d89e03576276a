//! Error types for rpzwatch
//!
//! Transient network faults never surface here: the resolver client and the
//! redirect tracer fold them into answer categories and trace fields. What
//! remains are configuration, persistence and invariant errors.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for rpzwatch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP client construction errors
    #[error("HTTP error: {0}")]
    Http(String),

    /// Persistent storage errors (domain metadata, group mapping)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Advisory lock could not be acquired within the bounded wait
    #[error("Timed out waiting for lock {}", path.display())]
    LockTimeout {
        /// Sidecar lock file
        path: PathBuf,
    },

    /// Filesystem / socket errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an HTTP error
    pub fn http(msg: impl Into<String>) -> Self {
        Self::Http(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a lock timeout error
    pub fn lock_timeout(path: impl Into<PathBuf>) -> Self {
        Self::LockTimeout { path: path.into() }
    }

    /// Whether the failed operation may succeed if retried on a later cycle
    ///
    /// The scheduler requeues either way; this only decides how loudly a
    /// failed flush is reported.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::LockTimeout { .. } | Self::Io(_) | Self::Storage(_))
    }
}
