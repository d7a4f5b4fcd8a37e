//! Port definitions (hexagonal architecture interfaces)
//!
//! This module defines the port traits that form the boundaries of the
//! hexagonal architecture. Ports are interfaces that the domain core
//! depends on, but whose implementations live in adapter crates.
//!
//! ## Ports Overview
//!
//! - [`StorageBackend`] - Remote storage logins, session resume, and events
//! - [`TokenStore`] / [`AdminCredentialStore`] - Durable single-record storage
//! - [`FileService`] - Request handling for the exposed file server
//! - [`NetworkProbe`] - Reachability checks before the file server starts

pub mod file_service;
pub mod network;
pub mod storage_backend;
pub mod token_store;

pub use file_service::{http_date, FileService, RequestHandler, ResponseBody, EPOCH_HTTP_DATE};
pub use network::{AlwaysReachable, NetworkProbe};
pub use storage_backend::{
    event_channel, BackendEvent, DriveSession, EntryInfo, EventReceiver, EventSender,
    SessionEvent, StorageBackend,
};
pub use token_store::{AdminCredentialStore, TokenStore};
