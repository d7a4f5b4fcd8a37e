//! Connection status of the drive session
//!
//! [`AuthStatus`] is the record polled by the control API. It can only be
//! produced through the transition constructors below, which keep the
//! invariant `logged_in => !needs_login`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Error recorded when the backend reports that tokens expired
pub const EXPIRED_MESSAGE: &str = "Tokens expired";

/// Error recorded at startup when no usable token was persisted
pub const NO_TOKEN_MESSAGE: &str = "No valid tokens found";

/// State of the drive session state machine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No session; waiting for a login
    #[default]
    NoToken,
    /// A login attempt is in flight
    LoggingIn,
    /// Session established; the file server may run
    Connected,
    /// The backend expired the session
    Expired,
}

impl ConnectionState {
    /// Returns true if the file server is allowed to run in this state
    pub fn allows_server(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::NoToken => write!(f, "no_token"),
            ConnectionState::LoggingIn => write!(f, "logging_in"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Expired => write!(f, "expired"),
        }
    }
}

/// Polled record of the current connection to the storage backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthStatus {
    logged_in: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    last_login: Option<DateTime<Utc>>,
    needs_login: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    error: Option<String>,
}

impl AuthStatus {
    /// Status at process start: not logged in, nothing attempted yet
    pub fn initial() -> Self {
        Self::default()
    }

    /// Successful interactive login at `at`
    pub fn connected(at: DateTime<Utc>) -> Self {
        Self {
            logged_in: true,
            last_login: Some(at),
            needs_login: false,
            error: None,
        }
    }

    /// Session resumed from a stored token; `last_login` carries over
    pub fn resumed(&self) -> Self {
        Self {
            logged_in: true,
            last_login: self.last_login,
            needs_login: false,
            error: None,
        }
    }

    /// Failed login attempt with the backend's message
    pub fn failed(&self, message: impl Into<String>) -> Self {
        Self {
            logged_in: false,
            last_login: self.last_login,
            needs_login: true,
            error: Some(message.into()),
        }
    }

    /// Tokens expired
    pub fn expired(&self) -> Self {
        self.failed(EXPIRED_MESSAGE)
    }

    /// Explicit logout
    pub fn logged_out(&self) -> Self {
        Self {
            logged_in: false,
            last_login: self.last_login,
            needs_login: true,
            error: None,
        }
    }

    // --- Getters ---

    pub fn logged_in(&self) -> bool {
        self.logged_in
    }

    pub fn last_login(&self) -> Option<DateTime<Utc>> {
        self.last_login
    }

    pub fn needs_login(&self) -> bool {
        self.needs_login
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}
