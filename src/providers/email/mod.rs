//! Mail transport implementations.
//!
//! This module contains the [`MailConnector`] / [`MailSession`] seam and its
//! implementations:
//!
//! - [`ImapConnector`] - IMAP over TLS or plain TCP
//! - [`MemoryTransport`] - in-process mailboxes with fault injection
//!
//! It also hosts [`normalize`], which turns raw payloads into
//! [`NormalizedMessage`](crate::domain::NormalizedMessage)s.
//!
//! # Example
//!
//! ```ignore
//! use mailsync::providers::email::{MailConnector, MemoryTransport};
//!
//! let transport = MemoryTransport::new();
//! let mailbox = transport.mailbox(&"work".into()).await;
//! mailbox.deliver("INBOX", raw, chrono::Utc::now()).await;
//! ```

mod imap;
mod memory;
mod normalize;
mod traits;

pub use imap::{ImapConnector, ImapSession};
pub use memory::{MemoryMailbox, MemorySession, MemoryTransport};
pub use normalize::{normalize, ParseError};
pub use traits::{
    FetchedMessage, IdleEvent, MailConnector, MailSession, MailboxSnapshot, Result,
    TransportError,
};
