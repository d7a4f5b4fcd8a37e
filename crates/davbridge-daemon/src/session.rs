//! Drive session orchestration
//!
//! [`SessionOrchestrator`] owns the connection to the storage backend and
//! decides whether the file server should be running. It reacts to three
//! kinds of input:
//! - logins and logouts requested through the control API
//! - the stored token found at startup
//! - [`BackendEvent`]s (renewal, expiry) delivered on the event channel
//!
//! Each drive session reports its events under the epoch it was opened in.
//! Events from a session that has since been replaced are dropped, even if
//! they are still queued when the next session connects.
//!
//! ## Transitions
//!
//! Every transition that changes whether the server should run bumps an
//! epoch and cancels the previous pending server start. Server starts run
//! detached and only proceed while their epoch is still current, checked
//! under the lifecycle lock, so a start that lost a race with a logout or
//! an expiry can never bring the server back.
//!
//! Opening a drive session waits for the network first and retries while
//! the backend is unreachable. The wait runs outside the login gate, so a
//! logout or a new login can always replace it.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, PoisonError, RwLock,
};

use chrono::Utc;
use davbridge_core::{
    config::AutoLoginFailurePolicy,
    domain::{
        AuthStatus, BackendError, ConnectionState, Credentials, SessionToken, NO_TOKEN_MESSAGE,
    },
    ports::{
        event_channel, BackendEvent, DriveSession, EventReceiver, EventSender, SessionEvent,
        StorageBackend, TokenStore,
    },
};
use davbridge_server::{ServerError, ServerLifecycle};
use thiserror::Error;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

/// Errors returned by session operations
#[derive(Debug, Error)]
pub enum SessionError {
    /// The backend rejected the credentials; the message is user-facing
    #[error("{0}")]
    Credential(String),

    #[error("No stored session token")]
    NoStoredToken,

    /// The stored token could not be read or was refused
    #[error("Invalid session token: {0}")]
    Token(String),

    /// Automatic re-login failed under the `exit` policy
    #[error("Automatic login failed: {0}")]
    AutoLoginFailed(String),

    /// A newer login, logout or shutdown replaced the operation
    #[error("Superseded by a newer session change")]
    Superseded,

    #[error(transparent)]
    Backend(BackendError),
}

impl From<BackendError> for SessionError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Credential(message) => SessionError::Credential(message),
            BackendError::Token(message) => SessionError::Token(message),
            other => SessionError::Backend(other),
        }
    }
}

#[derive(Debug, Default)]
struct SessionState {
    status: AuthStatus,
    connection: ConnectionState,
}

struct TransitionSlot {
    /// Cancelled when the next transition begins
    pending: CancellationToken,
    /// Context of the open drive session, if any
    session_ctx: Option<CancellationToken>,
}

/// Epoch counter and drive-session slot, shared with detached starts
#[derive(Clone)]
struct Transitions {
    epoch: Arc<AtomicU64>,
    slot: Arc<Mutex<TransitionSlot>>,
}

impl Transitions {
    fn new() -> Self {
        Self {
            epoch: Arc::new(AtomicU64::new(0)),
            slot: Arc::new(Mutex::new(TransitionSlot {
                pending: CancellationToken::new(),
                session_ctx: None,
            })),
        }
    }

    /// Supersedes the pending start and closes the open drive session
    fn begin(&self, parent: &CancellationToken) -> (u64, CancellationToken) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.pending.cancel();
        if let Some(ctx) = slot.session_ctx.take() {
            ctx.cancel();
        }
        slot.pending = parent.child_token();

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(epoch, "Session transition");
        (epoch, slot.pending.clone())
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    /// Records `ctx` as the open drive session if `epoch` is still current
    ///
    /// A superseded context is cancelled instead.
    fn install(&self, epoch: u64, ctx: CancellationToken) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.is_current(epoch) {
            ctx.cancel();
            return false;
        }
        if let Some(previous) = slot.session_ctx.replace(ctx) {
            previous.cancel();
        }
        true
    }
}

/// Coordinates logins, token persistence and the file server
pub struct SessionOrchestrator {
    backend: Arc<dyn StorageBackend>,
    tokens: Arc<dyn TokenStore>,
    server: Arc<ServerLifecycle>,
    events: EventSender,
    auto_login: Option<Credentials>,
    failure_policy: AutoLoginFailurePolicy,
    parent: CancellationToken,
    state: RwLock<SessionState>,
    transitions: Transitions,
    /// Serializes logins, resumes and logouts
    login_gate: tokio::sync::Mutex<()>,
    starts: TaskTracker,
}

impl SessionOrchestrator {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        tokens: Arc<dyn TokenStore>,
        server: Arc<ServerLifecycle>,
    ) -> Self {
        Self {
            backend,
            tokens,
            server,
            events: event_channel().0,
            auto_login: None,
            failure_policy: AutoLoginFailurePolicy::default(),
            parent: CancellationToken::new(),
            state: RwLock::new(SessionState::default()),
            transitions: Transitions::new(),
            login_gate: tokio::sync::Mutex::new(()),
            starts: TaskTracker::new(),
        }
    }

    /// Channel drive sessions report renewals and expiry on
    ///
    /// Its receiver is what [`SessionOrchestrator::run`] consumes. Without
    /// it, backend events are discarded.
    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = events;
        self
    }

    /// Credentials used to log in again after the tokens expire
    pub fn with_auto_login(mut self, credentials: Option<Credentials>) -> Self {
        self.auto_login = credentials.map(Credentials::normalized);
        self
    }

    pub fn with_failure_policy(mut self, policy: AutoLoginFailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Makes drive-session contexts and pending starts children of `parent`
    pub fn with_parent(mut self, parent: CancellationToken) -> Self {
        self.parent = parent;
        self
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Snapshot of the current status
    pub fn status(&self) -> AuthStatus {
        self.read_state().status.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.read_state().connection
    }

    pub fn server(&self) -> &Arc<ServerLifecycle> {
        &self.server
    }

    pub fn has_auto_login(&self) -> bool {
        self.auto_login.is_some()
    }

    // ------------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------------

    /// Logs in with `credentials` and starts the file server
    ///
    /// On success the token is persisted and a server start is scheduled;
    /// the call does not wait for the server. On failure the status records
    /// the backend's message and the server is left as it is.
    pub async fn login_interactive(&self, credentials: Credentials) -> Result<(), SessionError> {
        let _gate = self.login_gate.lock().await;
        let credentials = credentials.normalized();

        let previous = self.set_connection(ConnectionState::LoggingIn);
        info!(username = %credentials.username, "Logging in");

        let token = match self.backend.login(&credentials).await {
            Ok(token) => token,
            Err(e) => {
                warn!(username = %credentials.username, error = %e, "Login failed");
                self.update(|s| {
                    s.status = s.status.failed(e.to_string());
                    s.connection = previous;
                });
                return Err(e.into());
            }
        };

        self.persist(&token);
        let (epoch, pending) = self.begin_transition();
        self.update(|s| {
            s.status = AuthStatus::connected(Utc::now());
            s.connection = ConnectionState::Connected;
        });
        info!(username = %credentials.username, "Login successful");

        self.spawn_activation(token, epoch, pending);
        Ok(())
    }

    /// Resumes the session from the stored token and starts the file server
    ///
    /// Waits until the backend is reachable. A login or logout issued
    /// meanwhile replaces the resume, which then returns
    /// [`SessionError::Superseded`].
    pub async fn resume_from_token(&self) -> Result<(), SessionError> {
        let (token, epoch, pending) = {
            let _gate = self.login_gate.lock().await;
            let token = match self.tokens.load() {
                Ok(Some(token)) if token.is_usable() => token,
                Ok(_) => return Err(SessionError::NoStoredToken),
                Err(e) => return Err(SessionError::Token(e.to_string())),
            };
            let (epoch, pending) = self.begin_transition();
            self.set_connection(ConnectionState::LoggingIn);
            (token, epoch, pending)
        };

        let session = self.activation().open(&token, epoch, &pending).await?;

        let _gate = self.login_gate.lock().await;
        if !self.transitions.is_current(epoch) {
            return Err(SessionError::Superseded);
        }
        self.update(|s| {
            s.status = s.status.resumed();
            s.connection = ConnectionState::Connected;
        });
        info!(account = %session.account(), "Resumed session from stored token");

        self.spawn_start(session, epoch, pending);
        Ok(())
    }

    /// Stops the file server, forgets the stored token and requires a new login
    pub async fn logout(&self) {
        let _gate = self.login_gate.lock().await;

        self.begin_transition();
        self.server.stop().await;
        if let Err(e) = self.tokens.clear() {
            warn!(error = %e, "Failed to delete stored session token");
        }
        self.update(|s| {
            s.status = s.status.logged_out();
            s.connection = ConnectionState::NoToken;
        });
        info!("Logged out");
    }

    /// Startup sequence: resume from the stored token, else try auto-login
    ///
    /// Returns an error only when auto-login fails under the `exit` policy.
    pub async fn startup(&self) -> Result<(), SessionError> {
        match self.resume_from_token().await {
            Ok(()) => return Ok(()),
            Err(SessionError::Superseded) => {
                debug!("Stored session resume superseded");
                return Ok(());
            }
            Err(SessionError::NoStoredToken) => info!("No stored session token"),
            Err(e) => warn!(error = %e, "Could not resume stored session"),
        }

        self.update(|s| {
            s.status = s.status.failed(NO_TOKEN_MESSAGE);
            s.connection = ConnectionState::NoToken;
        });
        self.try_auto_login().await
    }

    /// Consumes backend events until `shutdown` fires
    ///
    /// Events are handled one at a time.
    pub async fn run(
        &self,
        mut events: EventReceiver,
        shutdown: CancellationToken,
    ) -> Result<(), SessionError> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await?,
                    None => {
                        debug!("Backend event channel closed");
                        shutdown.cancelled().await;
                        break;
                    }
                },
            }
        }
        Ok(())
    }

    /// Cancels pending work and stops the file server
    pub async fn shutdown(&self) {
        self.begin_transition();
        self.starts.close();
        self.starts.wait().await;
        self.server.stop().await;
        debug!("Session orchestrator stopped");
    }

    // ------------------------------------------------------------------------
    // Event handling
    // ------------------------------------------------------------------------

    async fn handle_event(&self, event: SessionEvent) -> Result<(), SessionError> {
        let SessionEvent { session, event } = event;
        match event {
            BackendEvent::TokensRenewed(token) => {
                let _gate = self.login_gate.lock().await;
                if !self.is_live(session) {
                    debug!(session, "Ignoring token renewal from an inactive session");
                    return Ok(());
                }
                self.persist(&token);
                debug!(session, "Persisted renewed session token");
                Ok(())
            }
            BackendEvent::TokensExpired => {
                {
                    let _gate = self.login_gate.lock().await;
                    if !self.is_live(session) {
                        debug!(session, "Ignoring expiry from an inactive session");
                        return Ok(());
                    }
                    warn!(session, "Session tokens expired");

                    self.begin_transition();
                    self.update(|s| {
                        s.status = s.status.expired();
                        s.connection = ConnectionState::Expired;
                    });
                    self.server.stop().await;
                }

                self.try_auto_login().await
            }
        }
    }

    /// Whether events from `session` still describe the connected session
    fn is_live(&self, session: u64) -> bool {
        self.transitions.is_current(session)
            && self.connection_state() == ConnectionState::Connected
    }

    async fn try_auto_login(&self) -> Result<(), SessionError> {
        let Some(credentials) = self.auto_login.clone() else {
            info!("Waiting for login through the control API");
            return Ok(());
        };

        info!("Attempting automatic login");
        match self.login_interactive(credentials).await {
            Ok(()) => Ok(()),
            Err(e) => match self.failure_policy {
                AutoLoginFailurePolicy::Wait => {
                    warn!(error = %e, "Automatic login failed, waiting for login");
                    Ok(())
                }
                AutoLoginFailurePolicy::Exit => {
                    error!(error = %e, "Automatic login failed");
                    Err(SessionError::AutoLoginFailed(e.to_string()))
                }
            },
        }
    }

    // ------------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------------

    fn begin_transition(&self) -> (u64, CancellationToken) {
        self.transitions.begin(&self.parent)
    }

    /// Opens the drive session for a fresh login, then starts the server
    fn spawn_activation(&self, token: SessionToken, epoch: u64, pending: CancellationToken) {
        let activation = self.activation();

        self.starts.spawn(async move {
            let opened = activation.open(&token, epoch, &pending).await;
            match opened {
                Ok(session) => activation.start(session, epoch, pending).await,
                Err(SessionError::Superseded) => debug!(epoch, "Session activation superseded"),
                Err(e) => error!(error = %e, "Failed to open drive session after login"),
            }
        });
    }

    /// Starts the server for an already opened session
    fn spawn_start(&self, session: Arc<dyn DriveSession>, epoch: u64, pending: CancellationToken) {
        let activation = self.activation();
        self.starts
            .spawn(async move { activation.start(session, epoch, pending).await });
    }

    fn activation(&self) -> Activation {
        Activation {
            backend: Arc::clone(&self.backend),
            events: self.events.clone(),
            parent: self.parent.clone(),
            server: Arc::clone(&self.server),
            transitions: self.transitions.clone(),
        }
    }

    fn persist(&self, token: &SessionToken) {
        if let Err(e) = self.tokens.store(token) {
            warn!(error = %e, "Failed to persist session token");
        }
    }

    // ------------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------------

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, SessionState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, f: impl FnOnce(&mut SessionState)) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut state);
    }

    /// Sets the connection state, returning the previous one
    fn set_connection(&self, connection: ConnectionState) -> ConnectionState {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut state.connection, connection)
    }
}

/// What opening a session and a detached server start need from the
/// orchestrator
struct Activation {
    backend: Arc<dyn StorageBackend>,
    events: EventSender,
    parent: CancellationToken,
    server: Arc<ServerLifecycle>,
    transitions: Transitions,
}

impl Activation {
    /// Resumes the backend session for `token` under `epoch`
    ///
    /// Waits for the network before each attempt and retries with the
    /// server's backoff while the backend reports [`BackendError::Network`].
    /// Returns [`SessionError::Superseded`] once `pending` is cancelled.
    async fn open(
        &self,
        token: &SessionToken,
        epoch: u64,
        pending: &CancellationToken,
    ) -> Result<Arc<dyn DriveSession>, SessionError> {
        let backoff = self.server.backoff();
        let mut attempt: u32 = 0;

        loop {
            if self.server.wait_for_network(pending).await.is_err() {
                return Err(SessionError::Superseded);
            }

            let ctx = self.parent.child_token();
            let resumed = tokio::select! {
                result = self.backend.resume(token, ctx.clone(), self.events.scoped(epoch)) => result,
                _ = pending.cancelled() => Err(BackendError::Closed),
            };

            match resumed {
                Ok(session) if self.transitions.install(epoch, ctx.clone()) => return Ok(session),
                Ok(_) => return Err(SessionError::Superseded),
                Err(_) if pending.is_cancelled() => {
                    ctx.cancel();
                    return Err(SessionError::Superseded);
                }
                Err(BackendError::Network(e)) => {
                    ctx.cancel();
                    let delay = backoff.delay(attempt);
                    warn!(
                        epoch,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Backend unreachable, retrying session resume"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = pending.cancelled() => return Err(SessionError::Superseded),
                    }
                    attempt = attempt.saturating_add(1);
                }
                Err(e) => {
                    ctx.cancel();
                    return Err(e.into());
                }
            }
        }
    }

    async fn start(self, session: Arc<dyn DriveSession>, epoch: u64, pending: CancellationToken) {
        let transitions = self.transitions.clone();
        let guard = move || transitions.is_current(epoch);

        match self.server.start_if(session, &pending, guard).await {
            Ok(Some(addr)) => debug!(epoch, addr = %addr, "Server start complete"),
            Ok(None) | Err(ServerError::Cancelled) => {
                debug!(epoch, "Server start superseded");
            }
            Err(e) => error!(error = %e, "Failed to start file server"),
        }
    }
}
