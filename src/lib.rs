//! mailsync - multi-account IMAP synchronization core
//!
//! This crate keeps one long-lived session per mailbox account, backfills
//! recent history, listens for new mail through IMAP IDLE and feeds
//! normalized messages to a downstream sink that indexes, classifies and
//! notifies. Delivery is at-least-once; consumers deduplicate on
//! `(account id, message id)`.

pub mod config;
pub mod domain;
pub mod providers;
pub mod services;
pub mod storage;

pub use services::{SyncError, SyncOrchestrator};
