//! File server lifecycle
//!
//! [`ServerLifecycle`] owns at most one running file server. Start and stop
//! are serialized by a single async lock that is held for the whole
//! transition, including the wait for network reachability, so a start and
//! a stop can never interleave.
//!
//! Connections are served with hyper's HTTP/1 connection driver and tracked
//! with a [`TaskTracker`]. Stopping cancels the server context, closes the
//! listener, asks every open connection to finish gracefully, and aborts the
//! ones still open when the grace period runs out.

use std::{
    convert::Infallible,
    net::SocketAddr,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use davbridge_core::ports::{
    AlwaysReachable, DriveSession, FileService, NetworkProbe, RequestHandler,
};
use hyper::{server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::{net::TcpListener, net::TcpStream, sync::Mutex, task::JoinHandle};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

use crate::network::{wait_for_network, Backoff};

/// Default time open connections get to finish after a stop
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Errors returned when starting the file server
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listen address could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The start was cancelled while waiting for the network
    #[error("Server start cancelled")]
    Cancelled,
}

// ============================================================================
// ServerHandle
// ============================================================================

/// A running file server
struct ServerHandle {
    addr: SocketAddr,
    /// Server context; cancelling it stops accepting and starts the drain
    ctx: CancellationToken,
    /// Fired after the grace period to drop connections still open
    abort: CancellationToken,
    accept_task: JoinHandle<()>,
    connections: TaskTracker,
}

impl ServerHandle {
    async fn shutdown(self, grace_period: Duration) {
        let ServerHandle {
            addr,
            ctx,
            abort,
            accept_task,
            connections,
        } = self;

        ctx.cancel();
        if let Err(e) = accept_task.await {
            warn!(addr = %addr, error = %e, "Accept loop ended abnormally");
        }

        connections.close();
        if tokio::time::timeout(grace_period, connections.wait())
            .await
            .is_err()
        {
            warn!(
                addr = %addr,
                open = connections.len(),
                "Grace period elapsed, aborting open connections"
            );
            abort.cancel();
            connections.wait().await;
        }

        info!(addr = %addr, "File server stopped");
    }
}

// ============================================================================
// ServerLifecycle
// ============================================================================

/// Starts and stops the file server
pub struct ServerLifecycle {
    listen: String,
    file_service: Arc<dyn FileService>,
    probe: Arc<dyn NetworkProbe>,
    backoff: Backoff,
    grace_period: Duration,
    parent: CancellationToken,
    handle: Mutex<Option<ServerHandle>>,
    bound: RwLock<Option<SocketAddr>>,
}

impl ServerLifecycle {
    /// Creates an idle lifecycle serving `file_service` on `listen`
    pub fn new(listen: impl Into<String>, file_service: Arc<dyn FileService>) -> Self {
        Self {
            listen: listen.into(),
            file_service,
            probe: Arc::new(AlwaysReachable),
            backoff: Backoff::default(),
            grace_period: DEFAULT_GRACE_PERIOD,
            parent: CancellationToken::new(),
            handle: Mutex::new(None),
            bound: RwLock::new(None),
        }
    }

    /// Sets the probe consulted before every start
    pub fn with_probe(mut self, probe: Arc<dyn NetworkProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Makes every server context a child of `parent`
    pub fn with_parent(mut self, parent: CancellationToken) -> Self {
        self.parent = parent;
        self
    }

    /// Starts the server for `session`, replacing any running one
    ///
    /// Returns once the listener is bound.
    pub async fn start(&self, session: Arc<dyn DriveSession>) -> Result<SocketAddr, ServerError> {
        let never = CancellationToken::new();
        match self.start_if(session, &never, || true).await? {
            Some(addr) => Ok(addr),
            None => Err(ServerError::Cancelled),
        }
    }

    /// Starts the server only while `guard` holds
    ///
    /// The guard is evaluated after the lifecycle lock is acquired and again
    /// after the network wait. If it fails, nothing is touched and
    /// `Ok(None)` is returned. `cancel` aborts a pending network wait.
    pub async fn start_if<G>(
        &self,
        session: Arc<dyn DriveSession>,
        cancel: &CancellationToken,
        guard: G,
    ) -> Result<Option<SocketAddr>, ServerError>
    where
        G: Fn() -> bool,
    {
        let mut slot = self.handle.lock().await;

        if cancel.is_cancelled() || !guard() {
            debug!("Skipping superseded server start");
            return Ok(None);
        }

        if let Some(previous) = slot.take() {
            debug!(addr = %previous.addr, "Replacing running file server");
            self.set_bound(None);
            previous.shutdown(self.grace_period).await;
        }

        wait_for_network(self.probe.as_ref(), self.backoff, cancel).await?;
        if !guard() {
            debug!("Server start superseded during network wait");
            return Ok(None);
        }

        let listener = TcpListener::bind(self.listen.as_str())
            .await
            .map_err(|source| ServerError::Bind {
                addr: self.listen.clone(),
                source,
            })?;
        let addr = listener.local_addr().map_err(|source| ServerError::Bind {
            addr: self.listen.clone(),
            source,
        })?;

        let ctx = self.parent.child_token();
        let abort = CancellationToken::new();
        let connections = TaskTracker::new();
        let handler = self.file_service.bind(session, ctx.clone());

        let accept_task = tokio::spawn(accept_loop(
            listener,
            handler,
            ctx.clone(),
            abort.clone(),
            connections.clone(),
        ));

        *slot = Some(ServerHandle {
            addr,
            ctx,
            abort,
            accept_task,
            connections,
        });
        self.set_bound(Some(addr));

        info!(addr = %addr, "File server listening");
        Ok(Some(addr))
    }

    /// Blocks until the probe reports the network as reachable
    ///
    /// Uses the same probe and backoff as a server start but does not take
    /// the lifecycle lock.
    pub async fn wait_for_network(&self, cancel: &CancellationToken) -> Result<(), ServerError> {
        wait_for_network(self.probe.as_ref(), self.backoff, cancel).await
    }

    /// Retry schedule shared with callers waiting on the backend
    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Stops the running server; a no-op when idle
    pub async fn stop(&self) {
        let mut slot = self.handle.lock().await;
        let Some(handle) = slot.take() else {
            debug!("File server not running");
            return;
        };
        self.set_bound(None);
        handle.shutdown(self.grace_period).await;
    }

    pub fn is_running(&self) -> bool {
        self.local_addr().is_some()
    }

    /// Address of the running server
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_bound(&self, addr: Option<SocketAddr>) {
        *self.bound.write().unwrap_or_else(PoisonError::into_inner) = addr;
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: Arc<dyn RequestHandler>,
    ctx: CancellationToken,
    abort: CancellationToken,
    connections: TaskTracker,
) {
    loop {
        tokio::select! {
            _ = ctx.cancelled() => break,
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    connections.spawn(serve_connection(
                        stream,
                        peer,
                        Arc::clone(&handler),
                        ctx.clone(),
                        abort.clone(),
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
        }
    }
    debug!("Accept loop finished");
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<dyn RequestHandler>,
    ctx: CancellationToken,
    abort: CancellationToken,
) {
    let service = service_fn(move |request| {
        let handler = Arc::clone(&handler);
        async move { Ok::<_, Infallible>(handler.handle(request).await) }
    });
    let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(e) = result {
                debug!(peer = %peer, error = %e, "Connection error");
            }
            return;
        }
        _ = ctx.cancelled() => {}
    }

    conn.as_mut().graceful_shutdown();
    tokio::select! {
        result = conn.as_mut() => {
            if let Err(e) = result {
                debug!(peer = %peer, error = %e, "Connection error during shutdown");
            }
        }
        _ = abort.cancelled() => {
            debug!(peer = %peer, "Connection aborted");
        }
    }
}
