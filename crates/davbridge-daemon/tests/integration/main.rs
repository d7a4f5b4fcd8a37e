//! Integration tests for davbridge-daemon
//!
//! Drives the session orchestrator and the control API against a scripted
//! storage backend, an in-memory token store and a real file server bound
//! to an ephemeral port.

mod common;

mod test_session;
