//! Local development backend
//!
//! [`LocalBackend`] implements the [`StorageBackend`] port on top of a local
//! directory. It accepts a single configured account and issues random
//! session tokens with a fixed lifetime. While a session is open, a refresh
//! task renews the token shortly before it would expire and reports each
//! renewal on the event sender handed to `resume`. The session expires once it is revoked or
//! its renewal budget is spent.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use base64::Engine;
use davbridge_core::{
    config::BackendConfig,
    domain::{BackendError, Credentials, SessionToken},
    ports::{BackendEvent, DriveSession, EventSender, StorageBackend},
};
use rand::RngCore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::drive::LocalDrive;

/// Message returned for a wrong username or password
pub const INVALID_CREDENTIALS: &str = "Incorrect login credentials. Please try again.";

/// Message returned for a missing or wrong second factor
pub const INVALID_TWO_FACTOR: &str = "Incorrect two-factor code";

/// Message returned when no account is configured
pub const LOGIN_DISABLED: &str = "Login is disabled: no account configured";

const TOKEN_BYTES: usize = 24;

/// [`StorageBackend`] serving a local directory
pub struct LocalBackend {
    root: PathBuf,
    username: String,
    password: String,
    two_factor: Option<String>,
    token_lifetime: Duration,
    max_renewals: Option<u32>,
    /// Bumped by [`LocalBackend::revoke`]; sessions resumed earlier expire
    generation: Arc<AtomicU64>,
}

impl LocalBackend {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            root: config.root.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            two_factor: config.two_factor.clone().filter(|c| !c.is_empty()),
            token_lifetime: Duration::from_secs(config.token_lifetime_secs),
            max_renewals: config.max_renewals,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Overrides the token lifetime
    pub fn with_token_lifetime(mut self, lifetime: Duration) -> Self {
        self.token_lifetime = lifetime;
        self
    }

    /// Invalidates every open session at its next renewal
    pub fn revoke(&self) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(generation, "Revoked open sessions");
    }

    /// Session identifier bound to the configured account
    fn uid(&self) -> String {
        format!("local:{}", self.username)
    }

    fn issue(&self) -> SessionToken {
        SessionToken {
            uid: self.uid(),
            access_token: random_token(),
            refresh_token: random_token(),
            salted_key_pass: random_token(),
        }
    }

    /// Time between renewals: four fifths of the token lifetime
    fn renew_interval(&self) -> Duration {
        (self.token_lifetime * 4 / 5).max(Duration::from_millis(1))
    }
}

#[async_trait::async_trait]
impl StorageBackend for LocalBackend {
    async fn login(&self, credentials: &Credentials) -> Result<SessionToken, BackendError> {
        if self.username.is_empty() || self.password.is_empty() {
            return Err(BackendError::Credential(LOGIN_DISABLED.to_string()));
        }
        if credentials.username != self.username || credentials.password != self.password {
            warn!(username = %credentials.username, "Rejected login");
            return Err(BackendError::Credential(INVALID_CREDENTIALS.to_string()));
        }
        if let Some(expected) = &self.two_factor {
            if credentials.two_factor.as_deref() != Some(expected.as_str()) {
                warn!(username = %credentials.username, "Rejected second factor");
                return Err(BackendError::Credential(INVALID_TWO_FACTOR.to_string()));
            }
        }

        info!(username = %self.username, "Login accepted");
        Ok(self.issue())
    }

    async fn resume(
        &self,
        token: &SessionToken,
        ctx: CancellationToken,
        events: EventSender,
    ) -> Result<Arc<dyn DriveSession>, BackendError> {
        if !token.is_usable() {
            return Err(BackendError::Token("empty access token".to_string()));
        }
        if token.uid != self.uid() {
            return Err(BackendError::Token(
                "token was issued for another account".to_string(),
            ));
        }

        let drive = LocalDrive::open(self.username.clone(), &self.root, ctx.clone()).await?;
        info!(
            username = %self.username,
            root = %drive.root().display(),
            session = events.session(),
            "Session resumed"
        );

        tokio::spawn(refresh_cycle(RefreshCycle {
            token: token.clone(),
            interval: self.renew_interval(),
            max_renewals: self.max_renewals,
            events,
            generation: Arc::clone(&self.generation),
            resumed_at: self.generation.load(Ordering::SeqCst),
            ctx,
        }));

        Ok(Arc::new(drive))
    }
}

struct RefreshCycle {
    token: SessionToken,
    interval: Duration,
    max_renewals: Option<u32>,
    events: EventSender,
    generation: Arc<AtomicU64>,
    resumed_at: u64,
    ctx: CancellationToken,
}

async fn refresh_cycle(cycle: RefreshCycle) {
    let RefreshCycle {
        mut token,
        interval,
        max_renewals,
        events,
        generation,
        resumed_at,
        ctx,
    } = cycle;
    let mut renewals: u32 = 0;

    loop {
        tokio::select! {
            _ = ctx.cancelled() => {
                debug!("Refresh cycle stopped");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        let revoked = generation.load(Ordering::SeqCst) != resumed_at;
        let exhausted = max_renewals.is_some_and(|max| renewals >= max);
        if revoked || exhausted {
            info!(revoked, renewals, "Session can no longer be renewed");
            let _ = events.send(BackendEvent::TokensExpired);
            return;
        }

        renewals += 1;
        token.access_token = random_token();
        token.refresh_token = random_token();
        debug!(renewals, "Renewed session token");
        if events.send(BackendEvent::TokensRenewed(token.clone())).is_err() {
            debug!("Event receiver closed, ending refresh cycle");
            return;
        }
    }
}

fn random_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}
