//! Domain error types
//!
//! This module defines the error taxonomy shared across the workspace:
//! failures reported by a storage backend, failures of the admin
//! authentication subsystem, and persistence failures.

use thiserror::Error;

/// Errors reported by a storage backend
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Username, password, mailbox password or second factor rejected
    #[error("{0}")]
    Credential(String),

    /// The backend could not be reached
    #[error("Network unavailable: {0}")]
    Network(String),

    /// A session token is missing, malformed or no longer accepted
    #[error("Invalid session token: {0}")]
    Token(String),

    /// The requested path does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The requested path is malformed or escapes the drive root
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// The session was closed while the operation was pending
    #[error("Session closed")]
    Closed,

    /// Any other backend failure
    #[error("Backend error: {0}")]
    Other(String),
}

/// Errors returned by the admin authentication subsystem
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdminAuthError {
    #[error("Admin already initialized")]
    AlreadyInitialized,

    #[error("Password must be at least {min} characters")]
    WeakPassword {
        /// Minimum accepted length
        min: usize,
    },

    #[error("Admin not initialized")]
    NotInitialized,

    #[error("Invalid password")]
    InvalidPassword,

    /// The credential could not be written, so setup did not take effect
    #[error("Error storing password: {0}")]
    Persistence(String),
}

/// Errors raised by token and credential persistence
#[derive(Debug, Error)]
pub enum StoreError {
    /// No data directory could be determined for this platform
    #[error("Cannot determine data directory")]
    DataDir,

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Keyring error: {0}")]
    Keyring(String),
}
