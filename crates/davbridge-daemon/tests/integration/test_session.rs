//! Session orchestrator: logins, resume, expiry, logout and races with
//! pending server starts

use std::{
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use davbridge_core::{
    config::AutoLoginFailurePolicy,
    domain::{ConnectionState, Credentials, EXPIRED_MESSAGE, NO_TOKEN_MESSAGE},
    ports::{event_channel, BackendEvent},
};
use davbridge_daemon::{SessionError, SessionOrchestrator};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::common::{
    eventually, gated_server, good_credentials, orchestrator, token, GatedProbe,
    MemoryTokenStore, ScriptedBackend, REJECTED,
};

/// Wires the event channel into `session` and runs its event loop in the
/// background
fn run_events(
    session: SessionOrchestrator,
) -> (
    Arc<SessionOrchestrator>,
    CancellationToken,
    JoinHandle<Result<(), SessionError>>,
) {
    let (tx, rx) = event_channel();
    let session = Arc::new(session.with_events(tx));
    let shutdown = CancellationToken::new();
    let handle = {
        let session = Arc::clone(&session);
        let token = shutdown.clone();
        tokio::spawn(async move { session.run(rx, token).await })
    };
    (session, shutdown, handle)
}

async fn connected(session: &SessionOrchestrator) -> bool {
    eventually(|| {
        session.connection_state() == ConnectionState::Connected && session.server().is_running()
    })
    .await
}

// ============================================================================
// Login
// ============================================================================

#[tokio::test]
async fn test_login_starts_server_and_persists_token() {
    let backend = ScriptedBackend::new();
    let tokens = MemoryTokenStore::new();
    let session = orchestrator(Arc::clone(&backend), Arc::clone(&tokens));

    session
        .login_interactive(good_credentials())
        .await
        .expect("login should succeed");

    let status = session.status();
    assert!(status.logged_in());
    assert!(!status.needs_login());
    assert!(status.last_login().is_some());
    assert!(status.error().is_none());
    assert_eq!(tokens.current().unwrap().access_token, "login-1");

    assert!(connected(&session).await);
    assert_eq!(backend.open_sessions(), 1);

    session.shutdown().await;
    assert!(!session.server().is_running());
}

#[tokio::test]
async fn test_failed_login_records_backend_message() {
    let backend = ScriptedBackend::new();
    let tokens = MemoryTokenStore::new();
    let session = orchestrator(backend, Arc::clone(&tokens));

    let err = session
        .login_interactive(Credentials::new("alice", "wrong"))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Credential(ref m) if m == REJECTED));
    assert_eq!(err.to_string(), REJECTED);

    let status = session.status();
    assert!(!status.logged_in());
    assert!(status.needs_login());
    assert_eq!(status.error(), Some(REJECTED));
    assert_eq!(session.connection_state(), ConnectionState::NoToken);
    assert!(tokens.current().is_none());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!session.server().is_running());
}

#[tokio::test]
async fn test_failed_login_leaves_running_server() {
    let backend = ScriptedBackend::new();
    let session = orchestrator(backend, MemoryTokenStore::new());

    session.login_interactive(good_credentials()).await.unwrap();
    assert!(connected(&session).await);

    assert!(session
        .login_interactive(Credentials::new("alice", "wrong"))
        .await
        .is_err());
    assert_eq!(session.connection_state(), ConnectionState::Connected);
    assert!(session.server().is_running());
    assert_eq!(session.status().error(), Some(REJECTED));

    session.shutdown().await;
}

#[tokio::test]
async fn test_second_login_replaces_drive_session() {
    let backend = ScriptedBackend::new();
    let session = orchestrator(Arc::clone(&backend), MemoryTokenStore::new());

    session.login_interactive(good_credentials()).await.unwrap();
    assert!(connected(&session).await);
    session.login_interactive(good_credentials()).await.unwrap();

    assert!(eventually(|| backend.resumes.load(Ordering::SeqCst) == 2).await);
    assert!(connected(&session).await);
    assert!(eventually(|| backend.open_sessions() == 1).await);

    session.shutdown().await;
    assert_eq!(backend.open_sessions(), 0);
}

// ============================================================================
// Resume and startup
// ============================================================================

#[tokio::test]
async fn test_resume_from_stored_token() {
    let backend = ScriptedBackend::new();
    let tokens = MemoryTokenStore::holding(token("stored"));
    let session = orchestrator(Arc::clone(&backend), tokens);

    session.resume_from_token().await.unwrap();

    let status = session.status();
    assert!(status.logged_in());
    assert!(status.last_login().is_none());
    assert!(connected(&session).await);
    assert_eq!(backend.logins.load(Ordering::SeqCst), 0);

    session.shutdown().await;
}

#[tokio::test]
async fn test_resume_without_usable_token() {
    let session = orchestrator(ScriptedBackend::new(), MemoryTokenStore::new());
    assert!(matches!(
        session.resume_from_token().await,
        Err(SessionError::NoStoredToken)
    ));

    let blank = orchestrator(ScriptedBackend::new(), MemoryTokenStore::holding(token("")));
    assert!(matches!(
        blank.resume_from_token().await,
        Err(SessionError::NoStoredToken)
    ));
}

#[tokio::test]
async fn test_resume_reports_unreadable_token() {
    let tokens = MemoryTokenStore::new();
    tokens.fail_load.store(true, Ordering::SeqCst);
    let session = orchestrator(ScriptedBackend::new(), tokens);

    assert!(matches!(
        session.resume_from_token().await,
        Err(SessionError::Token(_))
    ));
}

#[tokio::test]
async fn test_startup_without_token_waits_for_login() {
    let session = orchestrator(ScriptedBackend::new(), MemoryTokenStore::new());

    session.startup().await.unwrap();

    let status = session.status();
    assert!(!status.logged_in());
    assert!(status.needs_login());
    assert_eq!(status.error(), Some(NO_TOKEN_MESSAGE));
    assert_eq!(session.connection_state(), ConnectionState::NoToken);
    assert!(!session.server().is_running());
}

#[tokio::test]
async fn test_startup_falls_back_when_token_refused() {
    let backend = ScriptedBackend::new();
    backend.reject_resume.store(true, Ordering::SeqCst);
    let session = orchestrator(backend, MemoryTokenStore::holding(token("stale")));

    session.startup().await.unwrap();
    assert_eq!(session.status().error(), Some(NO_TOKEN_MESSAGE));
    assert_eq!(session.connection_state(), ConnectionState::NoToken);
}

#[tokio::test]
async fn test_startup_auto_login() {
    let backend = ScriptedBackend::new();
    let tokens = MemoryTokenStore::new();
    let session = orchestrator(Arc::clone(&backend), Arc::clone(&tokens))
        .with_auto_login(Some(good_credentials()));

    session.startup().await.unwrap();

    assert!(session.status().logged_in());
    assert!(connected(&session).await);
    assert!(tokens.current().is_some());
    session.shutdown().await;
}

#[tokio::test]
async fn test_startup_auto_login_failure_policies() {
    let bad = Some(Credentials::new("alice", "wrong"));

    let waiting = orchestrator(ScriptedBackend::new(), MemoryTokenStore::new())
        .with_auto_login(bad.clone());
    waiting.startup().await.unwrap();
    assert_eq!(waiting.status().error(), Some(REJECTED));

    let exiting = orchestrator(ScriptedBackend::new(), MemoryTokenStore::new())
        .with_auto_login(bad)
        .with_failure_policy(AutoLoginFailurePolicy::Exit);
    let err = exiting.startup().await.unwrap_err();
    assert!(matches!(err, SessionError::AutoLoginFailed(ref m) if m == REJECTED));
}

#[tokio::test]
async fn test_offline_startup_waits_for_network_then_resumes() {
    let probe = Arc::new(GatedProbe::default());
    let backend = ScriptedBackend::new();
    let tokens = MemoryTokenStore::holding(token("stored"));
    let session = Arc::new(SessionOrchestrator::new(
        Arc::clone(&backend) as _,
        Arc::clone(&tokens) as _,
        gated_server(Arc::clone(&probe)),
    ));

    let startup = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.startup().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(!startup.is_finished());
    assert_eq!(session.connection_state(), ConnectionState::LoggingIn);
    assert!(session.status().error().is_none());
    assert_eq!(tokens.current().unwrap().access_token, "stored");
    assert!(!session.server().is_running());

    probe.open.store(true, Ordering::SeqCst);
    startup.await.unwrap().unwrap();

    assert!(session.status().logged_in());
    assert!(connected(&session).await);
    assert_eq!(backend.logins.load(Ordering::SeqCst), 0);
    session.shutdown().await;
}

#[tokio::test]
async fn test_resume_retries_while_backend_unreachable() {
    let probe = Arc::new(GatedProbe::default());
    probe.open.store(true, Ordering::SeqCst);
    let backend = ScriptedBackend::new();
    backend.offline.store(true, Ordering::SeqCst);
    let session = Arc::new(SessionOrchestrator::new(
        Arc::clone(&backend) as _,
        MemoryTokenStore::holding(token("stored")),
        gated_server(probe),
    ));

    let startup = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.startup().await })
    };
    assert!(eventually(|| backend.resumes.load(Ordering::SeqCst) >= 3).await);
    assert_ne!(session.connection_state(), ConnectionState::NoToken);
    assert!(session.status().error().is_none());

    backend.offline.store(false, Ordering::SeqCst);
    startup.await.unwrap().unwrap();

    assert!(connected(&session).await);
    assert_eq!(backend.open_sessions(), 1);
    session.shutdown().await;
}

#[tokio::test]
async fn test_logout_during_offline_startup_wins() {
    let probe = Arc::new(GatedProbe::default());
    let backend = ScriptedBackend::new();
    let tokens = MemoryTokenStore::holding(token("stored"));
    let session = Arc::new(SessionOrchestrator::new(
        Arc::clone(&backend) as _,
        Arc::clone(&tokens) as _,
        gated_server(Arc::clone(&probe)),
    ));

    let startup = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.startup().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    tokio::time::timeout(Duration::from_secs(2), session.logout())
        .await
        .expect("logout should not wait for the network");
    startup.await.unwrap().unwrap();

    probe.open.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(session.connection_state(), ConnectionState::NoToken);
    assert!(tokens.current().is_none());
    assert!(session.status().error().is_none());
    assert!(!session.server().is_running());
    assert_eq!(backend.resumes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_login_activation_retries_while_backend_unreachable() {
    let probe = Arc::new(GatedProbe::default());
    probe.open.store(true, Ordering::SeqCst);
    let backend = ScriptedBackend::new();
    backend.offline.store(true, Ordering::SeqCst);
    let session = SessionOrchestrator::new(
        Arc::clone(&backend) as _,
        MemoryTokenStore::new(),
        gated_server(probe),
    );

    session.login_interactive(good_credentials()).await.unwrap();
    assert!(eventually(|| backend.resumes.load(Ordering::SeqCst) >= 2).await);
    assert!(!session.server().is_running());

    backend.offline.store(false, Ordering::SeqCst);
    assert!(connected(&session).await);
    assert_eq!(backend.open_sessions(), 1);
    session.shutdown().await;
}

// ============================================================================
// Backend events
// ============================================================================

#[tokio::test]
async fn test_expiry_without_auto_login_stops_server() {
    let backend = ScriptedBackend::new();
    let (session, shutdown, handle) =
        run_events(orchestrator(Arc::clone(&backend), MemoryTokenStore::new()));
    session.login_interactive(good_credentials()).await.unwrap();
    assert!(connected(&session).await);

    backend.emit(BackendEvent::TokensExpired);

    assert!(eventually(|| session.connection_state() == ConnectionState::Expired).await);
    assert!(eventually(|| !session.server().is_running()).await);
    let status = session.status();
    assert!(!status.logged_in());
    assert!(status.needs_login());
    assert_eq!(status.error(), Some(EXPIRED_MESSAGE));
    assert_eq!(backend.open_sessions(), 0);

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_expiry_with_auto_login_reconnects() {
    let backend = ScriptedBackend::new();
    let (session, shutdown, handle) = run_events(
        orchestrator(Arc::clone(&backend), MemoryTokenStore::new())
            .with_auto_login(Some(good_credentials())),
    );
    session.login_interactive(good_credentials()).await.unwrap();
    assert!(connected(&session).await);

    backend.emit(BackendEvent::TokensExpired);

    assert!(eventually(|| backend.logins.load(Ordering::SeqCst) == 2).await);
    assert!(connected(&session).await);
    assert!(session.status().logged_in());

    shutdown.cancel();
    handle.await.unwrap().unwrap();
    session.shutdown().await;
}

#[tokio::test]
async fn test_expiry_auto_login_failure_exits_run() {
    let backend = ScriptedBackend::new();
    let (session, _shutdown, handle) = run_events(
        orchestrator(Arc::clone(&backend), MemoryTokenStore::new())
            .with_auto_login(Some(Credentials::new("alice", "wrong")))
            .with_failure_policy(AutoLoginFailurePolicy::Exit),
    );
    session.login_interactive(good_credentials()).await.unwrap();
    assert!(connected(&session).await);

    backend.emit(BackendEvent::TokensExpired);

    let result = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("run should return")
        .unwrap();
    assert!(matches!(result, Err(SessionError::AutoLoginFailed(_))));
    assert!(!session.server().is_running());
}

#[tokio::test]
async fn test_renewal_persists_new_token() {
    let backend = ScriptedBackend::new();
    let tokens = MemoryTokenStore::new();
    let (session, shutdown, handle) =
        run_events(orchestrator(Arc::clone(&backend), Arc::clone(&tokens)));
    session.login_interactive(good_credentials()).await.unwrap();
    assert!(connected(&session).await);

    backend.emit(BackendEvent::TokensRenewed(token("renewed")));

    assert!(eventually(|| tokens
        .current()
        .is_some_and(|t| t.access_token == "renewed"))
    .await);

    shutdown.cancel();
    handle.await.unwrap().unwrap();
    session.shutdown().await;
}

#[tokio::test]
async fn test_renewal_persist_failure_stays_connected() {
    let backend = ScriptedBackend::new();
    let tokens = MemoryTokenStore::new();
    let (session, shutdown, handle) =
        run_events(orchestrator(Arc::clone(&backend), Arc::clone(&tokens)));
    session.login_interactive(good_credentials()).await.unwrap();
    assert!(connected(&session).await);
    tokens.fail_store.store(true, Ordering::SeqCst);

    backend.emit(BackendEvent::TokensRenewed(token("renewed")));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(session.connection_state(), ConnectionState::Connected);
    assert!(session.server().is_running());
    assert_eq!(tokens.current().unwrap().access_token, "login-1");

    shutdown.cancel();
    handle.await.unwrap().unwrap();
    session.shutdown().await;
}

#[tokio::test]
async fn test_events_from_logged_out_session_are_ignored() {
    let backend = ScriptedBackend::new();
    let tokens = MemoryTokenStore::new();
    let (session, shutdown, handle) =
        run_events(orchestrator(Arc::clone(&backend), Arc::clone(&tokens)));
    session.login_interactive(good_credentials()).await.unwrap();
    assert!(connected(&session).await);
    session.logout().await;

    backend.emit(BackendEvent::TokensRenewed(token("stray")));
    backend.emit(BackendEvent::TokensExpired);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(tokens.current().is_none());
    assert_eq!(session.connection_state(), ConnectionState::NoToken);
    assert!(session.status().error().is_none());

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_stale_expiry_does_not_end_newer_session() {
    let backend = ScriptedBackend::new();
    let tokens = MemoryTokenStore::new();
    let (session, shutdown, handle) =
        run_events(orchestrator(Arc::clone(&backend), Arc::clone(&tokens)));
    session.login_interactive(good_credentials()).await.unwrap();
    assert!(connected(&session).await);

    // The first session expires while the second login is in flight, so
    // the event is handled only after the second session is connected.
    backend.login_delay_ms.store(200, Ordering::SeqCst);
    let second = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.login_interactive(good_credentials()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    backend.emit_from(0, BackendEvent::TokensExpired);
    second.await.unwrap().unwrap();

    assert!(eventually(|| backend.resumes.load(Ordering::SeqCst) == 2).await);
    assert!(connected(&session).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(session.connection_state(), ConnectionState::Connected);
    assert!(session.server().is_running());
    assert!(session.status().error().is_none());
    assert_eq!(backend.open_sessions(), 1);
    assert_eq!(tokens.current().unwrap().access_token, "login-2");

    shutdown.cancel();
    handle.await.unwrap().unwrap();
    session.shutdown().await;
}

#[tokio::test]
async fn test_stale_renewal_does_not_overwrite_newer_token() {
    let backend = ScriptedBackend::new();
    let tokens = MemoryTokenStore::new();
    let (session, shutdown, handle) =
        run_events(orchestrator(Arc::clone(&backend), Arc::clone(&tokens)));
    session.login_interactive(good_credentials()).await.unwrap();
    assert!(connected(&session).await);

    backend.login_delay_ms.store(200, Ordering::SeqCst);
    let second = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.login_interactive(good_credentials()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    backend.emit_from(0, BackendEvent::TokensRenewed(token("stale")));
    second.await.unwrap().unwrap();
    assert!(connected(&session).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(tokens.current().unwrap().access_token, "login-2");

    // Renewals from the current session still land
    backend.emit(BackendEvent::TokensRenewed(token("renewed")));
    assert!(eventually(|| tokens
        .current()
        .is_some_and(|t| t.access_token == "renewed"))
    .await);

    shutdown.cancel();
    handle.await.unwrap().unwrap();
    session.shutdown().await;
}

// ============================================================================
// Logout
// ============================================================================

#[tokio::test]
async fn test_logout_stops_server_and_forgets_token() {
    let backend = ScriptedBackend::new();
    let tokens = MemoryTokenStore::new();
    let session = orchestrator(Arc::clone(&backend), Arc::clone(&tokens));
    session.login_interactive(good_credentials()).await.unwrap();
    assert!(connected(&session).await);

    session.logout().await;

    assert!(!session.server().is_running());
    assert!(tokens.current().is_none());
    assert_eq!(backend.open_sessions(), 0);
    let status = session.status();
    assert!(!status.logged_in());
    assert!(status.needs_login());
    assert!(status.error().is_none());
    assert!(status.last_login().is_some());
    assert_eq!(session.connection_state(), ConnectionState::NoToken);
}

#[tokio::test]
async fn test_logout_during_pending_start_leaves_no_server() {
    let probe = Arc::new(GatedProbe::default());
    let backend = ScriptedBackend::new();
    let session = SessionOrchestrator::new(
        Arc::clone(&backend) as _,
        MemoryTokenStore::new(),
        gated_server(Arc::clone(&probe)),
    );

    session.login_interactive(good_credentials()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!session.server().is_running());
    assert_eq!(backend.resumes.load(Ordering::SeqCst), 0);

    session.logout().await;
    probe.open.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(!session.server().is_running());
    assert_eq!(session.connection_state(), ConnectionState::NoToken);
    assert_eq!(backend.resumes.load(Ordering::SeqCst), 0);
    assert_eq!(backend.open_sessions(), 0);
}

#[tokio::test]
async fn test_pending_start_completes_when_network_returns() {
    let probe = Arc::new(GatedProbe::default());
    let session = SessionOrchestrator::new(
        ScriptedBackend::new(),
        MemoryTokenStore::new(),
        gated_server(Arc::clone(&probe)),
    );

    session.login_interactive(good_credentials()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!session.server().is_running());

    probe.open.store(true, Ordering::SeqCst);
    assert!(connected(&session).await);
    session.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_cancels_pending_start() {
    let probe = Arc::new(GatedProbe::default());
    let session = SessionOrchestrator::new(
        ScriptedBackend::new(),
        MemoryTokenStore::new(),
        gated_server(Arc::clone(&probe)),
    );

    session.login_interactive(good_credentials()).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), session.shutdown())
        .await
        .expect("shutdown should not wait for the network");

    probe.open.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!session.server().is_running());
}
