//! Persistence ports for session tokens and the admin credential
//!
//! Both stores hold at most one record. Loading a missing record is not an
//! error: it returns `Ok(None)`. Deleting a missing record is a no-op.

use crate::domain::{AdminCredential, SessionToken, StoreError};

/// Durable storage for the storage-backend session token
pub trait TokenStore: Send + Sync {
    /// Loads the persisted token, if any
    fn load(&self) -> Result<Option<SessionToken>, StoreError>;

    /// Replaces the persisted token
    fn store(&self, token: &SessionToken) -> Result<(), StoreError>;

    /// Removes the persisted token
    fn clear(&self) -> Result<(), StoreError>;
}

/// Durable storage for the admin credential
pub trait AdminCredentialStore: Send + Sync {
    /// Loads the persisted credential, if any
    fn load(&self) -> Result<Option<AdminCredential>, StoreError>;

    /// Replaces the persisted credential
    fn store(&self, credential: &AdminCredential) -> Result<(), StoreError>;

    /// Removes the persisted credential
    fn clear(&self) -> Result<(), StoreError>;
}
