//! davbridge Core - Domain logic and business rules
//!
//! This crate contains the hexagonal architecture core with:
//! - **Domain entities** - `AuthStatus`, `AdminCredential`, `AdminSession`, `SessionToken`
//! - **Use cases** - `AdminAuth`
//! - **Port definitions** - `StorageBackend`, `TokenStore`, `FileService`, `NetworkProbe`
//! - **Configuration** - YAML-backed `Config`
//!
//! # Architecture
//!
//! This crate follows the hexagonal (ports & adapters) architecture pattern.
//! The domain module contains pure business logic with no I/O.
//! Ports define trait interfaces that adapter crates implement.
//! Use cases orchestrate domain entities through port interfaces.

pub mod config;
pub mod domain;
pub mod ports;
pub mod usecases;
