//! Database and credential storage.
//!
//! This module provides the storage layer for mailsync:
//!
//! - SQLite database holding normalized copies of synced messages
//! - OS keychain integration for account secrets
//! - Async-safe database operations via tokio::task::spawn_blocking

mod database;
mod keychain;
pub mod queries;
mod schema;

pub use database::{Database, DatabaseError, Result};
pub use keychain::{KeychainAccess, KeychainError, SecretSource};
pub use queries::messages::StoredMessage;
