//! Storage backend port (driven/secondary port)
//!
//! This module defines the interface to the remote storage service that
//! davbridge exposes. The backend performs logins, resumes sessions from
//! stored tokens, and answers read requests issued by a file service.
//!
//! ## Design Notes
//!
//! - Token renewal and token expiry are not callbacks. `resume` is handed an
//!   [`EventSender`] scoped to the session it opens and reports
//!   [`BackendEvent`]s through it. A single coordination loop consumes them,
//!   so event handling never re-enters a lock held by the code that caused
//!   the event.
//! - Every event carries the scope of the session that produced it. Events
//!   still queued from a session that has since been replaced can be told
//!   apart from events of the current one.
//! - `resume` receives the session context. Cancelling it ends the
//!   backend's refresh cycle and unblocks every pending request issued
//!   through the returned [`DriveSession`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::domain::{BackendError, Credentials, SessionToken};

// ============================================================================
// Backend events
// ============================================================================

/// Asynchronous notifications emitted by a storage backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    /// The backend renewed the session; the new token replaces the old one
    TokensRenewed(SessionToken),
    /// The session can no longer be renewed; a new login is required
    TokensExpired,
}

/// A [`BackendEvent`] tagged with the session scope it was sent under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub session: u64,
    pub event: BackendEvent,
}

/// Sending half of the backend event channel, bound to one session scope
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<SessionEvent>,
    session: u64,
}

impl EventSender {
    /// A sender on the same channel that tags events with `session`
    pub fn scoped(&self, session: u64) -> Self {
        Self {
            tx: self.tx.clone(),
            session,
        }
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    /// Sends `event` under this sender's scope
    ///
    /// # Errors
    ///
    /// Returns the event back if the receiver has been dropped.
    pub fn send(&self, event: BackendEvent) -> Result<(), BackendEvent> {
        self.tx
            .send(SessionEvent {
                session: self.session,
                event,
            })
            .map_err(|e| e.0.event)
    }
}

/// Receiving half of the backend event channel
pub type EventReceiver = mpsc::UnboundedReceiver<SessionEvent>;

/// Creates a backend event channel; the sender starts in scope 0
pub fn event_channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx, session: 0 }, rx)
}

// ============================================================================
// Drive entries
// ============================================================================

/// Metadata for a file or folder in the drive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryInfo {
    /// Entry name (empty for the root)
    pub name: String,
    /// Whether this entry is a folder
    pub is_dir: bool,
    /// Size in bytes (0 for folders)
    pub size: u64,
    /// Last modification time, if known
    pub modified: Option<DateTime<Utc>>,
}

// ============================================================================
// Ports
// ============================================================================

/// An authenticated session against the storage backend
///
/// Paths are `/`-separated and relative to the drive root. Implementations
/// must fail with [`BackendError::Closed`] once the session context passed
/// to [`StorageBackend::resume`] is cancelled.
#[async_trait::async_trait]
pub trait DriveSession: Send + Sync {
    /// Account the session belongs to
    fn account(&self) -> &str;

    /// Metadata for a single entry
    async fn stat(&self, path: &str) -> Result<EntryInfo, BackendError>;

    /// Children of a folder
    async fn list(&self, path: &str) -> Result<Vec<EntryInfo>, BackendError>;

    /// Full content of a file
    async fn read(&self, path: &str) -> Result<Vec<u8>, BackendError>;
}

/// Port trait for the remote storage service
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync {
    /// Performs an interactive login and returns the resulting session token
    ///
    /// Rejected credentials are reported as [`BackendError::Credential`]
    /// with a message suitable for showing to the user verbatim.
    async fn login(&self, credentials: &Credentials) -> Result<SessionToken, BackendError>;

    /// Resumes a session from a stored token
    ///
    /// Starts the backend's renewal cycle for this session. Renewals and
    /// expiry are reported on `events` until `ctx` is cancelled.
    ///
    /// An unreachable backend is reported as [`BackendError::Network`];
    /// callers treat it as retryable, never as a refused token.
    async fn resume(
        &self,
        token: &SessionToken,
        ctx: CancellationToken,
        events: EventSender,
    ) -> Result<Arc<dyn DriveSession>, BackendError>;
}
