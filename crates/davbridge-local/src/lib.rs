//! davbridge Local - Local-directory storage adapter
//!
//! A development backend that needs no remote service:
//! - [`LocalBackend`] - `StorageBackend` with token issue, renewal and expiry
//! - [`LocalDrive`] - `DriveSession` over a directory
//! - [`LocalFileService`] - read-only HTTP file service for any `DriveSession`

pub mod backend;
pub mod drive;
pub mod service;

pub use backend::LocalBackend;
pub use drive::LocalDrive;
pub use service::{FileHandler, LocalFileService};
