//! Domain layer types for mailsync.
//!
//! This module contains the core domain types used throughout the crate:
//! accounts, normalized messages, sync events, session modes, and
//! classification labels.

mod account;
mod label;
mod message;
mod session;
mod types;

pub use account::{Account, AccountConfig, ConfigError, IMAPS_PORT, IMAP_PORT};
pub use label::{EmailLabel, UnknownLabel};
pub use message::{Address, Attachment, NormalizedMessage, SyncEvent};
pub use session::{SessionMode, SessionStatus};
pub use types::{AccountId, DedupKey, MessageId};
