//! Credential source
//!
//! Storage-backend credentials can come from the environment:
//!
//! | Variable | Meaning |
//! |---|---|
//! | `PROTON_USERNAME` | account name |
//! | `PROTON_PASSWORD` | account password |
//! | `PROTON_MAILBOX_PASSWORD` | second password, `false` if the account has none |
//! | `PROTON_2FA` | one-time code, `false` if the account has none |
//!
//! An unset optional variable means "not configured": the interactive login
//! asks for it. The sentinel `false` means "intentionally absent" and is
//! never prompted for. Automatic login is possible only when both the
//! username and the password are set.

use std::{
    collections::HashMap,
    io::{self, BufRead, Write},
};

use davbridge_core::domain::Credentials;

pub const USERNAME_VAR: &str = "PROTON_USERNAME";
pub const PASSWORD_VAR: &str = "PROTON_PASSWORD";
pub const MAILBOX_PASSWORD_VAR: &str = "PROTON_MAILBOX_PASSWORD";
pub const TWO_FACTOR_VAR: &str = "PROTON_2FA";

/// Environment variable requesting an admin password reset at startup
pub const ADMIN_RESET_VAR: &str = "ADMIN_PASSWORD_RESET";

const ABSENT_SENTINEL: &str = "false";

/// Read access to environment variables
pub trait Environment: Send + Sync {
    fn var(&self, key: &str) -> Option<String>;
}

/// The process environment
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl Environment for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl Environment for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

/// Returns true if `ADMIN_PASSWORD_RESET=true`
pub fn admin_reset_requested(env: &dyn Environment) -> bool {
    env.var(ADMIN_RESET_VAR)
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
}

/// An optional credential field as found in the environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvValue {
    /// Not set (or empty): ask for it interactively
    Unset,
    /// Set to the `false` sentinel: the account has no such field
    Absent,
    Value(String),
}

impl EnvValue {
    fn read(env: &dyn Environment, key: &str) -> Self {
        match env.var(key) {
            None => EnvValue::Unset,
            Some(v) if v.is_empty() => EnvValue::Unset,
            Some(v) if v == ABSENT_SENTINEL => EnvValue::Absent,
            Some(v) => EnvValue::Value(v),
        }
    }

    fn value(&self) -> Option<String> {
        match self {
            EnvValue::Value(v) => Some(v.clone()),
            EnvValue::Unset | EnvValue::Absent => None,
        }
    }
}

/// Credentials as configured in the environment
#[derive(Clone, PartialEq, Eq)]
pub struct EnvCredentials {
    pub username: Option<String>,
    pub password: Option<String>,
    pub mailbox_password: EnvValue,
    pub two_factor: EnvValue,
}

impl std::fmt::Debug for EnvCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvCredentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("mailbox_password", &matches!(self.mailbox_password, EnvValue::Value(_)))
            .field("two_factor", &matches!(self.two_factor, EnvValue::Value(_)))
            .finish()
    }
}

impl EnvCredentials {
    pub fn from_env(env: &dyn Environment) -> Self {
        let non_empty = |key: &str| env.var(key).filter(|v| !v.is_empty());
        Self {
            username: non_empty(USERNAME_VAR),
            password: non_empty(PASSWORD_VAR),
            mailbox_password: EnvValue::read(env, MAILBOX_PASSWORD_VAR),
            two_factor: EnvValue::read(env, TWO_FACTOR_VAR),
        }
    }

    /// Credentials for automatic login, if username and password are set
    pub fn auto_login(&self) -> Option<Credentials> {
        let (Some(username), Some(password)) = (&self.username, &self.password) else {
            return None;
        };
        Some(Credentials {
            username: username.clone(),
            password: password.clone(),
            mailbox_password: self.mailbox_password.value(),
            two_factor: self.two_factor.value(),
        })
    }

    /// Completes the credentials, asking `prompt` for every unset field
    pub fn resolve(&self, prompt: &mut dyn Prompt) -> io::Result<Credentials> {
        let username = match &self.username {
            Some(v) => v.clone(),
            None => prompt.line("Username: ")?,
        };
        let password = match &self.password {
            Some(v) => v.clone(),
            None => prompt.secret("Password: ")?,
        };
        let mailbox_password = match &self.mailbox_password {
            EnvValue::Unset => {
                Some(prompt.secret("Mailbox password (leave empty if none): ")?)
            }
            other => other.value(),
        };
        let two_factor = match &self.two_factor {
            EnvValue::Unset => Some(prompt.line("2FA code (leave empty if none): ")?),
            other => other.value(),
        };

        Ok(Credentials {
            username: username.trim().to_string(),
            password,
            mailbox_password,
            two_factor: two_factor.map(|c| c.trim().to_string()),
        }
        .normalized())
    }
}

/// Source of interactively entered values
pub trait Prompt {
    /// Reads a visible line
    fn line(&mut self, label: &str) -> io::Result<String>;

    /// Reads a masked line
    fn secret(&mut self, label: &str) -> io::Result<String>;
}

/// Prompts on the controlling terminal
#[derive(Debug, Default)]
pub struct TerminalPrompt;

impl Prompt for TerminalPrompt {
    fn line(&mut self, label: &str) -> io::Result<String> {
        let mut stdout = io::stdout();
        stdout.write_all(label.as_bytes())?;
        stdout.flush()?;

        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
        Ok(line.trim_end_matches(&['\r', '\n'][..]).to_string())
    }

    fn secret(&mut self, label: &str) -> io::Result<String> {
        rpassword::prompt_password(label)
    }
}
