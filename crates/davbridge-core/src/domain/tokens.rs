//! Storage-backend credentials and session tokens

use serde::{Deserialize, Serialize};

/// Opaque credential bundle used to resume a storage-backend session
///
/// Replaced wholesale whenever the backend renews it. None of the fields
/// are interpreted outside the backend adapter, except that an empty
/// `access_token` marks the bundle as unusable.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionToken {
    /// Backend-specific session identifier
    #[serde(default)]
    pub uid: String,
    /// Bearer material for authenticated requests
    pub access_token: String,
    /// Material used by the backend to renew `access_token`
    #[serde(default)]
    pub refresh_token: String,
    /// Derived key passphrase needed to unlock account keys
    #[serde(default)]
    pub salted_key_pass: String,
}

impl SessionToken {
    /// Returns true if the token can be used to resume a session
    pub fn is_usable(&self) -> bool {
        !self.access_token.is_empty()
    }
}

impl std::fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionToken")
            .field("uid", &self.uid)
            .field("access_token", &redact(&self.access_token))
            .field("refresh_token", &redact(&self.refresh_token))
            .field("salted_key_pass", &redact(&self.salted_key_pass))
            .finish()
    }
}

/// Interactive credentials for a storage-backend login
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// Second password for accounts with two-password mode
    #[serde(default, rename = "mailbox_password")]
    pub mailbox_password: Option<String>,
    /// One-time code for accounts with two-factor authentication
    #[serde(default, rename = "twofa")]
    pub two_factor: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            mailbox_password: None,
            two_factor: None,
        }
    }

    pub fn with_mailbox_password(mut self, mailbox_password: impl Into<String>) -> Self {
        self.mailbox_password = Some(mailbox_password.into());
        self
    }

    pub fn with_two_factor(mut self, code: impl Into<String>) -> Self {
        self.two_factor = Some(code.into());
        self
    }

    /// Collapses empty optional fields to `None`
    pub fn normalized(mut self) -> Self {
        self.mailbox_password = self.mailbox_password.filter(|s| !s.is_empty());
        self.two_factor = self.two_factor.filter(|s| !s.is_empty());
        self
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &redact(&self.password))
            .field(
                "mailbox_password",
                &self.mailbox_password.as_deref().map(redact),
            )
            .field("two_factor", &self.two_factor.as_deref().map(redact))
            .finish()
    }
}

fn redact(value: &str) -> &'static str {
    if value.is_empty() {
        ""
    } else {
        "<redacted>"
    }
}
