//! Keyring-backed token storage
//!
//! Stores the session token in the OS credential store (GNOME Keyring,
//! KDE Wallet, macOS Keychain). The token is serialized as JSON under the
//! service name "davbridge".

use davbridge_core::{
    domain::{SessionToken, StoreError},
    ports::TokenStore,
};
use tracing::{debug, info};

/// Keyring service name
pub const KEYRING_SERVICE: &str = "davbridge";

/// Keyring entry name used when no account name is configured
pub const DEFAULT_KEYRING_USER: &str = "session";

/// [`TokenStore`] backed by the system keyring
#[derive(Debug, Clone)]
pub struct KeyringTokenStore {
    user: String,
}

impl KeyringTokenStore {
    /// Creates a store for the keyring entry named `user`
    pub fn new(user: impl Into<String>) -> Self {
        Self { user: user.into() }
    }

    fn entry(&self) -> Result<keyring::Entry, StoreError> {
        keyring::Entry::new(KEYRING_SERVICE, &self.user).map_err(keyring_error)
    }
}

impl Default for KeyringTokenStore {
    fn default() -> Self {
        Self::new(DEFAULT_KEYRING_USER)
    }
}

impl TokenStore for KeyringTokenStore {
    fn load(&self) -> Result<Option<SessionToken>, StoreError> {
        match self.entry()?.get_password() {
            Ok(json) => {
                let token = serde_json::from_str(&json)?;
                debug!(user = %self.user, "Loaded session token from keyring");
                Ok(Some(token))
            }
            Err(keyring::Error::NoEntry) => {
                debug!(user = %self.user, "No session token in keyring");
                Ok(None)
            }
            Err(e) => Err(keyring_error(e)),
        }
    }

    fn store(&self, token: &SessionToken) -> Result<(), StoreError> {
        let json = serde_json::to_string(token)?;
        self.entry()?.set_password(&json).map_err(keyring_error)?;
        debug!(user = %self.user, "Stored session token in keyring");
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        match self.entry()?.delete_credential() {
            Ok(()) => {
                info!(user = %self.user, "Cleared session token from keyring");
                Ok(())
            }
            Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(keyring_error(e)),
        }
    }
}

fn keyring_error(e: keyring::Error) -> StoreError {
    StoreError::Keyring(e.to_string())
}
