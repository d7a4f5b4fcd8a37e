//! Use cases (application services)
//!
//! Use cases orchestrate domain entities through port interfaces.
//!
//! ## Available Use Cases
//!
//! - [`AdminAuth`] - Admin password setup, login, and session gating

pub mod admin_auth;

pub use admin_auth::{AdminAuth, DEFAULT_SESSION_TTL_HOURS};
