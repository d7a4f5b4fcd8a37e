//! Admin credential and admin session entities
//!
//! The admin password is never stored: only a salted SHA-256 digest is
//! persisted. Admin sessions are random bearer tokens with an expiry.

use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Number of random bytes in a salt
const SALT_BYTES: usize = 16;

/// Number of random bytes in an admin session token
const TOKEN_BYTES: usize = 32;

/// Minimum admin password length, in bytes of UTF-8
pub const MIN_PASSWORD_LEN: usize = 8;

/// Persisted admin credential: salted digest of the admin password
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminCredential {
    password_hash: String,
    salt: String,
}

impl AdminCredential {
    /// Derives a credential for `password` with a freshly generated salt
    pub fn derive(password: &str) -> Self {
        let salt = random_base64(SALT_BYTES);
        let password_hash = digest(password, &salt);
        Self {
            password_hash,
            salt,
        }
    }

    /// Reconstitutes a credential from stored parts
    pub fn from_parts(password_hash: impl Into<String>, salt: impl Into<String>) -> Self {
        Self {
            password_hash: password_hash.into(),
            salt: salt.into(),
        }
    }

    /// Returns true if `password` matches this credential
    ///
    /// The digest comparison runs in constant time.
    pub fn verify(&self, password: &str) -> bool {
        let candidate = digest(password, &self.salt);
        constant_time_eq::constant_time_eq(candidate.as_bytes(), self.password_hash.as_bytes())
    }

    pub fn password_hash(&self) -> &str {
        &self.password_hash
    }

    pub fn salt(&self) -> &str {
        &self.salt
    }
}

/// A live admin session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminSession {
    token: String,
    expires_at: DateTime<Utc>,
}

impl AdminSession {
    /// Issues a new session with a random token valid for `ttl`
    pub fn issue(ttl: chrono::Duration) -> Self {
        Self {
            token: random_base64(TOKEN_BYTES),
            expires_at: Utc::now() + ttl,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

/// Hex-encoded SHA-256 of `password` concatenated with `salt`
pub fn digest(password: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hasher.update(salt.as_bytes());
    hex::encode(hasher.finalize())
}

fn random_base64(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::STANDARD.encode(bytes)
}
