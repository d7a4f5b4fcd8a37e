//! davbridge Daemon - Session orchestration and control API
//!
//! - [`session`] - drive session state machine and file server coordination
//! - [`api`] - admin-gated HTTP control API
//! - [`credentials`] - backend credentials from the environment or a prompt

pub mod api;
pub mod credentials;
pub mod session;

pub use api::AppState;
pub use session::{SessionError, SessionOrchestrator};
