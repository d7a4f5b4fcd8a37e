//! Control API
//!
//! JSON-over-HTTP interface used by the admin web UI:
//!
//! | Method | Path | Gated | Purpose |
//! |---|---|---|---|
//! | GET | `/api/status` | yes | drive session status |
//! | POST | `/api/login` | yes | log in to the storage backend |
//! | POST | `/api/logout` | yes | log out of the storage backend |
//! | GET | `/api/admin/status` | no | whether an admin password is set |
//! | POST | `/api/admin/setup` | no | set the first admin password |
//! | POST | `/api/admin/login` | no | open an admin session |
//! | POST | `/api/admin/logout` | no | close the admin session |
//!
//! Gated routes require a valid `admin_session` cookie once an admin
//! password exists. Error bodies are short plain text.

use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use davbridge_core::{
    domain::{AdminAuthError, AdminSession, Credentials},
    ports::{http_date, EPOCH_HTTP_DATE},
    usecases::AdminAuth,
};
use http_body_util::{BodyExt, Full, Limited};
use hyper::{
    body::{Bytes, Incoming},
    header::{HeaderMap, HeaderValue, ALLOW, CONTENT_TYPE, COOKIE, SET_COOKIE},
    server::conn::http1,
    service::service_fn,
    Method, Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::session::SessionOrchestrator;

/// Name of the admin session cookie
pub const SESSION_COOKIE: &str = "admin_session";

/// Largest accepted request body
pub const MAX_BODY_BYTES: usize = 64 * 1024;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type ApiResponse = Response<Full<Bytes>>;

/// Shared state for control API handlers
pub struct AppState {
    pub session: Arc<SessionOrchestrator>,
    pub admin: Arc<AdminAuth>,
}

impl AppState {
    pub fn new(session: Arc<SessionOrchestrator>, admin: Arc<AdminAuth>) -> Self {
        Self { session, admin }
    }
}

// ============================================================================
// Server
// ============================================================================

/// Serves the control API on `listener` until `shutdown` fires
pub async fn serve(listener: TcpListener, state: Arc<AppState>, shutdown: CancellationToken) {
    let connections = TaskTracker::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    connections.spawn(serve_connection(
                        stream,
                        peer,
                        Arc::clone(&state),
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept control connection");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
        }
    }
    drop(listener);

    connections.close();
    if tokio::time::timeout(SHUTDOWN_GRACE, connections.wait())
        .await
        .is_err()
    {
        warn!(open = connections.len(), "Control connections still open at shutdown");
    }
    info!("Control API stopped");
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) {
    let service = service_fn(move |request| {
        let state = Arc::clone(&state);
        async move { Ok::<_, Infallible>(handle(&state, request).await) }
    });
    let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(e) = result {
                debug!(peer = %peer, error = %e, "Control connection error");
            }
        }
        _ = shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            if let Err(e) = conn.await {
                debug!(peer = %peer, error = %e, "Control connection error during shutdown");
            }
        }
    }
}

/// Reads the body of `request` and dispatches it
pub async fn handle(state: &AppState, request: Request<Incoming>) -> ApiResponse {
    let (parts, body) = request.into_parts();
    let body = match Limited::new(body, MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!(error = %e, "Rejected request body");
            return text(StatusCode::PAYLOAD_TOO_LARGE, "Request too large");
        }
    };
    let token = session_cookie(&parts.headers);
    dispatch(state, &parts.method, parts.uri.path(), token.as_deref(), &body).await
}

// ============================================================================
// Routing
// ============================================================================

#[derive(Debug, Deserialize)]
struct PasswordRequest {
    password: String,
}

#[derive(Debug, Serialize)]
struct Success {
    success: bool,
}

#[derive(Debug, Serialize)]
struct AdminStatus {
    initialized: bool,
}

/// Routes one request
///
/// `token` is the value of the admin session cookie, if present.
pub async fn dispatch(
    state: &AppState,
    method: &Method,
    path: &str,
    token: Option<&str>,
    body: &[u8],
) -> ApiResponse {
    let (allowed, gated) = match path {
        "/api/status" => (Method::GET, true),
        "/api/login" | "/api/logout" => (Method::POST, true),
        "/api/admin/status" => (Method::GET, false),
        "/api/admin/setup" | "/api/admin/login" | "/api/admin/logout" => (Method::POST, false),
        _ => return text(StatusCode::NOT_FOUND, "Not found"),
    };

    if *method != allowed {
        let mut response = text(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed");
        if let Ok(value) = HeaderValue::from_str(allowed.as_str()) {
            response.headers_mut().insert(ALLOW, value);
        }
        return response;
    }

    if gated && !state.admin.authorize(token) {
        return text(StatusCode::UNAUTHORIZED, "Unauthorized");
    }

    match path {
        "/api/status" => json(StatusCode::OK, &state.session.status()),
        "/api/login" => backend_login(state, body).await,
        "/api/logout" => {
            state.session.logout().await;
            json(StatusCode::OK, &Success { success: true })
        }
        "/api/admin/status" => json(
            StatusCode::OK,
            &AdminStatus {
                initialized: state.admin.is_initialized(),
            },
        ),
        "/api/admin/setup" => admin_setup(state, body),
        "/api/admin/login" => admin_login(state, body),
        _ => admin_logout(state, token),
    }
}

async fn backend_login(state: &AppState, body: &[u8]) -> ApiResponse {
    let Ok(credentials) = serde_json::from_slice::<Credentials>(body) else {
        return text(StatusCode::BAD_REQUEST, "Invalid request");
    };

    match state.session.login_interactive(credentials).await {
        Ok(()) => json(StatusCode::OK, &Success { success: true }),
        Err(e) => text_owned(StatusCode::UNAUTHORIZED, e.to_string()),
    }
}

fn admin_setup(state: &AppState, body: &[u8]) -> ApiResponse {
    let Ok(request) = serde_json::from_slice::<PasswordRequest>(body) else {
        return text(StatusCode::BAD_REQUEST, "Invalid request");
    };

    match state.admin.setup(&request.password) {
        Ok(session) => {
            info!("Admin password set");
            with_session_cookie(&session)
        }
        Err(e @ (AdminAuthError::AlreadyInitialized | AdminAuthError::WeakPassword { .. })) => {
            text_owned(StatusCode::BAD_REQUEST, e.to_string())
        }
        Err(e) => {
            error!(error = %e, "Admin setup failed");
            text(StatusCode::INTERNAL_SERVER_ERROR, "Error storing password")
        }
    }
}

fn admin_login(state: &AppState, body: &[u8]) -> ApiResponse {
    let Ok(request) = serde_json::from_slice::<PasswordRequest>(body) else {
        return text(StatusCode::BAD_REQUEST, "Invalid request");
    };

    match state.admin.login(&request.password) {
        Ok(session) => with_session_cookie(&session),
        Err(AdminAuthError::NotInitialized) => {
            text(StatusCode::BAD_REQUEST, "Admin not initialized")
        }
        Err(_) => {
            warn!("Rejected admin login");
            text(StatusCode::UNAUTHORIZED, "Invalid password")
        }
    }
}

fn admin_logout(state: &AppState, token: Option<&str>) -> ApiResponse {
    if let Some(token) = token {
        state.admin.logout(token);
    }
    let mut response = json(StatusCode::OK, &Success { success: true });
    if let Ok(value) = HeaderValue::from_str(&clear_cookie()) {
        response.headers_mut().insert(SET_COOKIE, value);
    }
    response
}

// ============================================================================
// Cookies
// ============================================================================

const COOKIE_ATTRIBUTES: &str = "Path=/; HttpOnly; SameSite=Strict";

/// `Set-Cookie` value for an admin session
pub fn session_cookie_header(token: &str, expires_at: DateTime<Utc>) -> String {
    format!(
        "{SESSION_COOKIE}={token}; {COOKIE_ATTRIBUTES}; Expires={}",
        http_date(expires_at)
    )
}

/// `Set-Cookie` value that removes the admin session cookie
pub fn clear_cookie() -> String {
    format!(
        "{SESSION_COOKIE}=; {COOKIE_ATTRIBUTES}; Expires={EPOCH_HTTP_DATE}; Max-Age=0"
    )
}

/// Extracts the admin session token from the `Cookie` headers
pub fn session_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == SESSION_COOKIE && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

fn with_session_cookie(session: &AdminSession) -> ApiResponse {
    let mut response = json(StatusCode::OK, &Success { success: true });
    let cookie = session_cookie_header(session.token(), session.expires_at());
    match HeaderValue::from_str(&cookie) {
        Ok(value) => {
            response.headers_mut().insert(SET_COOKIE, value);
        }
        Err(e) => error!(error = %e, "Session cookie is not a valid header"),
    }
    response
}

// ============================================================================
// Responses
// ============================================================================

fn json<T: Serialize>(status: StatusCode, value: &T) -> ApiResponse {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            error!(error = %e, "Failed to encode response");
            text(StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
        }
    }
}

fn text(status: StatusCode, body: &'static str) -> ApiResponse {
    text_owned(status, body.to_string())
}

fn text_owned(status: StatusCode, body: String) -> ApiResponse {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

// ============================================================================
// Admin session sweeping
// ============================================================================

/// Periodically drops expired admin sessions until `shutdown` fires
pub async fn sweep_sessions(admin: Arc<AdminAuth>, every: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let removed = admin.sweep_expired();
                if removed > 0 {
                    debug!(removed, "Swept expired admin sessions");
                }
            }
        }
    }
}
