//! davbridge Store - Token and admin credential persistence
//!
//! Durable single-record storage for:
//! - The storage-backend session token (`tokens.json` or the system keyring)
//! - The admin credential (`admin_password.json`)
//!
//! ## Architecture
//!
//! This crate implements the `TokenStore` and `AdminCredentialStore` ports
//! from `davbridge-core`. It is a driven (secondary) adapter in the
//! hexagonal architecture.
//!
//! ## Usage
//!
//! ```no_run
//! use std::path::Path;
//! use davbridge_core::ports::TokenStore;
//! use davbridge_store::FileTokenStore;
//!
//! let store = FileTokenStore::new(Path::new("/home/user/.local/share/davbridge"));
//! let token = store.load().ok().flatten();
//! ```

pub mod file;
pub mod secret;

pub use file::{FileAdminCredentialStore, FileTokenStore, JsonFile};
pub use secret::KeyringTokenStore;
