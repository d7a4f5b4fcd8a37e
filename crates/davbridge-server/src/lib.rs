//! davbridge Server - File server lifecycle
//!
//! Runs the local file server for the current drive session:
//! - [`ServerLifecycle`] - serialized start/stop with graceful connection drain
//! - [`wait_for_network`] - capped exponential backoff until the backend is reachable
//! - [`HttpProbe`] - HEAD-request reachability probe

pub mod lifecycle;
pub mod network;

pub use lifecycle::{ServerError, ServerLifecycle, DEFAULT_GRACE_PERIOD};
pub use network::{wait_for_network, Backoff, HttpProbe};
