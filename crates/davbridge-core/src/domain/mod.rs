//! Domain entities and business logic
//!
//! This module contains the core domain types for davbridge:
//! - Connection status of the drive session
//! - Admin credential and admin sessions
//! - Storage-backend credentials and session tokens
//! - Domain-specific error types

pub mod admin;
pub mod auth_status;
pub mod errors;
pub mod tokens;

// Re-export commonly used types
pub use admin::{AdminCredential, AdminSession, MIN_PASSWORD_LEN};
pub use auth_status::{AuthStatus, ConnectionState, EXPIRED_MESSAGE, NO_TOKEN_MESSAGE};
pub use errors::{AdminAuthError, BackendError, StoreError};
pub use tokens::{Credentials, SessionToken};
