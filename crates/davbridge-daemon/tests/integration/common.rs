//! Shared test doubles for the daemon integration tests

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use davbridge_core::{
    domain::{AdminCredential, BackendError, Credentials, SessionToken, StoreError},
    ports::{
        AdminCredentialStore, BackendEvent, DriveSession, EntryInfo, EventSender, FileService,
        NetworkProbe, RequestHandler, ResponseBody, StorageBackend, TokenStore,
    },
    usecases::AdminAuth,
};
use davbridge_daemon::{AppState, SessionOrchestrator};
use davbridge_server::{Backoff, ServerLifecycle};
use hyper::{
    body::{Bytes, Incoming},
    Request, Response,
};
use tokio_util::sync::CancellationToken;

pub const USERNAME: &str = "alice";
pub const PASSWORD: &str = "correct horse";
pub const REJECTED: &str = "Incorrect login credentials. Please try again.";

pub fn token(access: &str) -> SessionToken {
    SessionToken {
        uid: format!("uid-{access}"),
        access_token: access.to_string(),
        refresh_token: format!("refresh-{access}"),
        salted_key_pass: "salt".to_string(),
    }
}

pub fn good_credentials() -> Credentials {
    Credentials::new(USERNAME, PASSWORD)
}

// ============================================================================
// Storage backend
// ============================================================================

/// Accepts `PASSWORD` for `USERNAME` and any usable token on resume
#[derive(Default)]
pub struct ScriptedBackend {
    pub logins: AtomicUsize,
    pub resumes: AtomicUsize,
    /// When set, resume rejects every token
    pub reject_resume: AtomicBool,
    /// When set, resume fails as if the backend were unreachable
    pub offline: AtomicBool,
    /// Milliseconds each login takes
    pub login_delay_ms: AtomicU64,
    contexts: Mutex<Vec<CancellationToken>>,
    senders: Mutex<Vec<EventSender>>,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of session contexts handed to resume that are still open
    pub fn open_sessions(&self) -> usize {
        self.contexts
            .lock()
            .unwrap()
            .iter()
            .filter(|ctx| !ctx.is_cancelled())
            .count()
    }

    /// Sends `event` from the session opened by the `nth` successful resume
    pub fn emit_from(&self, nth: usize, event: BackendEvent) {
        let sender = self.senders.lock().unwrap()[nth].clone();
        sender.send(event).unwrap();
    }

    /// Sends `event` from the most recently opened session
    pub fn emit(&self, event: BackendEvent) {
        let sender = self.senders.lock().unwrap().last().cloned().unwrap();
        sender.send(event).unwrap();
    }
}

#[async_trait]
impl StorageBackend for ScriptedBackend {
    async fn login(&self, credentials: &Credentials) -> Result<SessionToken, BackendError> {
        let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = self.login_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if credentials.username == USERNAME && credentials.password == PASSWORD {
            Ok(token(&format!("login-{n}")))
        } else {
            Err(BackendError::Credential(REJECTED.to_string()))
        }
    }

    async fn resume(
        &self,
        token: &SessionToken,
        ctx: CancellationToken,
        events: EventSender,
    ) -> Result<Arc<dyn DriveSession>, BackendError> {
        self.resumes.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(BackendError::Network("offline".to_string()));
        }
        if self.reject_resume.load(Ordering::SeqCst) || !token.is_usable() {
            return Err(BackendError::Token("refused".to_string()));
        }
        self.contexts.lock().unwrap().push(ctx.clone());
        self.senders.lock().unwrap().push(events);
        Ok(Arc::new(StubSession { ctx }))
    }
}

struct StubSession {
    ctx: CancellationToken,
}

#[async_trait]
impl DriveSession for StubSession {
    fn account(&self) -> &str {
        USERNAME
    }

    async fn stat(&self, path: &str) -> Result<EntryInfo, BackendError> {
        if self.ctx.is_cancelled() {
            return Err(BackendError::Closed);
        }
        Err(BackendError::NotFound(path.to_string()))
    }

    async fn list(&self, _path: &str) -> Result<Vec<EntryInfo>, BackendError> {
        if self.ctx.is_cancelled() {
            return Err(BackendError::Closed);
        }
        Ok(Vec::new())
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, BackendError> {
        self.stat(path).await.map(|_| Vec::new())
    }
}

// ============================================================================
// Stores
// ============================================================================

#[derive(Default)]
pub struct MemoryTokenStore {
    pub token: Mutex<Option<SessionToken>>,
    pub fail_store: AtomicBool,
    pub fail_load: AtomicBool,
}

impl MemoryTokenStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn holding(token: SessionToken) -> Arc<Self> {
        let store = Self::default();
        *store.token.lock().unwrap() = Some(token);
        Arc::new(store)
    }

    pub fn current(&self) -> Option<SessionToken> {
        self.token.lock().unwrap().clone()
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> Result<Option<SessionToken>, StoreError> {
        if self.fail_load.load(Ordering::SeqCst) {
            return Err(StoreError::Keyring("corrupt entry".to_string()));
        }
        Ok(self.current())
    }

    fn store(&self, token: &SessionToken) -> Result<(), StoreError> {
        if self.fail_store.load(Ordering::SeqCst) {
            return Err(StoreError::Io {
                path: "tokens.json".to_string(),
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            });
        }
        *self.token.lock().unwrap() = Some(token.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        *self.token.lock().unwrap() = None;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryAdminStore {
    credential: Mutex<Option<AdminCredential>>,
}

impl AdminCredentialStore for MemoryAdminStore {
    fn load(&self) -> Result<Option<AdminCredential>, StoreError> {
        Ok(self.credential.lock().unwrap().clone())
    }

    fn store(&self, credential: &AdminCredential) -> Result<(), StoreError> {
        *self.credential.lock().unwrap() = Some(credential.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        *self.credential.lock().unwrap() = None;
        Ok(())
    }
}

// ============================================================================
// File server
// ============================================================================

pub struct OkFileService;

struct OkHandler;

#[async_trait]
impl RequestHandler for OkHandler {
    async fn handle(&self, _request: Request<Incoming>) -> Response<ResponseBody> {
        Response::new(ResponseBody::new(Bytes::from_static(b"ok")))
    }
}

impl FileService for OkFileService {
    fn bind(
        &self,
        _session: Arc<dyn DriveSession>,
        _ctx: CancellationToken,
    ) -> Arc<dyn RequestHandler> {
        Arc::new(OkHandler)
    }
}

/// Reachable only once `open` is set
#[derive(Default)]
pub struct GatedProbe {
    pub open: AtomicBool,
}

#[async_trait]
impl NetworkProbe for GatedProbe {
    async fn check(&self) -> Result<(), BackendError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::Network("offline".to_string()))
        }
    }
}

pub fn server() -> Arc<ServerLifecycle> {
    Arc::new(
        ServerLifecycle::new("127.0.0.1:0", Arc::new(OkFileService))
            .with_grace_period(Duration::from_millis(200)),
    )
}

pub fn gated_server(probe: Arc<GatedProbe>) -> Arc<ServerLifecycle> {
    Arc::new(
        ServerLifecycle::new("127.0.0.1:0", Arc::new(OkFileService))
            .with_probe(probe)
            .with_backoff(Backoff::new(
                Duration::from_millis(10),
                Duration::from_millis(20),
            ))
            .with_grace_period(Duration::from_millis(200)),
    )
}

pub fn orchestrator(
    backend: Arc<ScriptedBackend>,
    tokens: Arc<MemoryTokenStore>,
) -> SessionOrchestrator {
    SessionOrchestrator::new(backend, tokens, server())
}

pub fn app_state(session: SessionOrchestrator) -> AppState {
    let admin = AdminAuth::load(
        Arc::new(MemoryAdminStore::default()),
        chrono::Duration::hours(1),
    );
    AppState::new(Arc::new(session), Arc::new(admin))
}

// ============================================================================
// Polling
// ============================================================================

/// Polls `condition` until it holds or two seconds pass
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
