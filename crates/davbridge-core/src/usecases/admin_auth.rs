//! Admin authentication use case
//!
//! Owns the admin credential and the set of live admin sessions, and gates
//! the control API. Exactly one admin credential exists at a time; any
//! number of sessions may be live concurrently.
//!
//! All mutable state sits behind one mutex, so `setup`, `login`, `logout`
//! and `authorize` are atomic with respect to each other. The lock is
//! never held across an `.await`.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::{
    domain::{AdminAuthError, AdminCredential, AdminSession, MIN_PASSWORD_LEN},
    ports::AdminCredentialStore,
};

/// Default lifetime of an admin session
pub const DEFAULT_SESSION_TTL_HOURS: i64 = 24;

#[derive(Debug, Default)]
struct AdminState {
    credential: Option<AdminCredential>,
    sessions: HashMap<String, DateTime<Utc>>,
}

/// Admin authentication subsystem
pub struct AdminAuth {
    store: Arc<dyn AdminCredentialStore>,
    session_ttl: Duration,
    state: Mutex<AdminState>,
}

impl AdminAuth {
    /// Creates the subsystem, loading any persisted credential from `store`
    ///
    /// A missing credential means the control API needs setup. An unreadable
    /// credential is logged and treated the same way.
    pub fn load(store: Arc<dyn AdminCredentialStore>, session_ttl: Duration) -> Self {
        let credential = match store.load() {
            Ok(Some(credential)) => {
                info!("Loaded admin credential");
                Some(credential)
            }
            Ok(None) => {
                info!("No admin credential set, setup required");
                None
            }
            Err(e) => {
                warn!(error = %e, "Failed to load admin credential, setup required");
                None
            }
        };

        Self {
            store,
            session_ttl,
            state: Mutex::new(AdminState {
                credential,
                sessions: HashMap::new(),
            }),
        }
    }

    /// Returns true iff an admin credential exists
    pub fn is_initialized(&self) -> bool {
        self.state().credential.is_some()
    }

    /// Sets the admin password for the first time and opens a session
    ///
    /// # Errors
    ///
    /// - [`AdminAuthError::AlreadyInitialized`] if a credential exists
    /// - [`AdminAuthError::WeakPassword`] if `password` is shorter than 8 bytes of UTF-8
    /// - [`AdminAuthError::Persistence`] if the credential cannot be written
    pub fn setup(&self, password: &str) -> Result<AdminSession, AdminAuthError> {
        let mut state = self.state();

        if state.credential.is_some() {
            return Err(AdminAuthError::AlreadyInitialized);
        }
        if password.len() < MIN_PASSWORD_LEN {
            return Err(AdminAuthError::WeakPassword {
                min: MIN_PASSWORD_LEN,
            });
        }

        let credential = AdminCredential::derive(password);
        self.store.store(&credential).map_err(|e| {
            warn!(error = %e, "Failed to persist admin credential");
            AdminAuthError::Persistence(e.to_string())
        })?;
        state.credential = Some(credential);

        info!("Admin password set");
        Ok(self.open_session(&mut state))
    }

    /// Verifies the admin password and opens an additional session
    ///
    /// # Errors
    ///
    /// - [`AdminAuthError::NotInitialized`] if no credential exists
    /// - [`AdminAuthError::InvalidPassword`] if the digest does not match
    pub fn login(&self, password: &str) -> Result<AdminSession, AdminAuthError> {
        let mut state = self.state();

        let credential = state
            .credential
            .as_ref()
            .ok_or(AdminAuthError::NotInitialized)?;
        if !credential.verify(password) {
            debug!("Admin login rejected");
            return Err(AdminAuthError::InvalidPassword);
        }

        Ok(self.open_session(&mut state))
    }

    /// Ends a session; unknown tokens are ignored
    pub fn logout(&self, token: &str) {
        if self.state().sessions.remove(token).is_some() {
            debug!("Admin session closed");
        }
    }

    /// Returns true if the caller may use the protected control API
    ///
    /// Access is open until a credential has been set up. Afterwards the
    /// token must map to a session that has not yet expired. Expired
    /// sessions are rejected even while still present in the map.
    pub fn authorize(&self, token: Option<&str>) -> bool {
        let state = self.state();
        if state.credential.is_none() {
            return true;
        }
        token
            .and_then(|t| state.sessions.get(t))
            .is_some_and(|expires_at| *expires_at > Utc::now())
    }

    /// Expiry of a live session, if the token is known
    pub fn session_expiry(&self, token: &str) -> Option<DateTime<Utc>> {
        self.state().sessions.get(token).copied()
    }

    /// Deletes the persisted credential and ends all sessions
    ///
    /// Used to recover when the operator has lost the admin password.
    pub fn reset(&self) {
        let mut state = self.state();
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "Failed to delete admin credential");
        }
        state.credential = None;
        state.sessions.clear();
        info!("Admin password has been reset");
    }

    /// Removes expired sessions and returns how many were dropped
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut state = self.state();
        let before = state.sessions.len();
        state.sessions.retain(|_, expires_at| *expires_at > now);
        let removed = before - state.sessions.len();
        if removed > 0 {
            debug!(removed, "Swept expired admin sessions");
        }
        removed
    }

    fn open_session(&self, state: &mut AdminState) -> AdminSession {
        let session = AdminSession::issue(self.session_ttl);
        state
            .sessions
            .insert(session.token().to_string(), session.expires_at());
        session
    }

    fn state(&self) -> MutexGuard<'_, AdminState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn insert_session(&self, token: &str, expires_at: DateTime<Utc>) {
        self.state().sessions.insert(token.to_string(), expires_at);
    }

    #[cfg(test)]
    fn session_count(&self) -> usize {
        self.state().sessions.len()
    }
}
