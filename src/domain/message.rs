//! Normalized message types.
//!
//! A [`NormalizedMessage`] is the canonical record produced from a raw
//! transport payload; a [`SyncEvent`] carries one to downstream consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AccountId, DedupKey, MessageId};

/// Canonical representation of one synced message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedMessage {
    /// Message-ID header, or a generated stand-in when absent.
    pub id: MessageId,
    /// Whether `id` was generated rather than read from the message.
    ///
    /// Generated ids are only unique within one process run: a restart derives
    /// a new id for the same physical message.
    pub id_generated: bool,
    /// Account this message was synced from.
    pub account_id: AccountId,
    /// Source folder.
    pub folder: String,
    /// Subject line, empty when absent.
    pub subject: String,
    /// Sender address, empty when absent.
    pub from: Address,
    /// Primary recipients.
    pub to: Vec<Address>,
    /// Carbon copy recipients.
    pub cc: Vec<Address>,
    /// Plain text body, empty when absent.
    pub body_text: String,
    /// HTML body; rendered from the text body when no HTML part exists.
    pub body_html: String,
    /// Date header, or the time of normalization when absent.
    pub date: DateTime<Utc>,
    /// Attachment descriptors.
    pub attachments: Vec<Attachment>,
}

impl NormalizedMessage {
    /// Returns the key that identifies this message across redeliveries.
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            account_id: self.account_id.clone(),
            message_id: self.id.clone(),
        }
    }
}

/// An email address with optional display name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    /// Email address.
    pub email: String,
    /// Display name (e.g., "Jane Doe").
    pub name: Option<String>,
}

impl Address {
    /// Creates a new address with just an email.
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: None,
        }
    }

    /// Creates a new address with email and display name.
    pub fn with_name(email: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: Some(name.into()),
        }
    }

    /// Returns true when neither an address nor a name is known.
    pub fn is_empty(&self) -> bool {
        self.email.is_empty() && self.name.is_none()
    }

    /// Returns the display representation of this address.
    ///
    /// If a name is present, returns "Name <email>", otherwise just the email.
    pub fn display(&self) -> String {
        match &self.name {
            Some(name) => format!("{} <{}>", name, self.email),
            None => self.email.clone(),
        }
    }
}

/// Descriptor of a file attached to a message. The content itself is not kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Original filename, or "unnamed".
    pub filename: String,
    /// MIME media type, or "application/octet-stream".
    pub content_type: String,
    /// Decoded size in bytes.
    pub size_bytes: u64,
}

/// Envelope placed on the shared output channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    /// Account the message was synced from.
    pub account_id: AccountId,
    /// The normalized message.
    pub message: NormalizedMessage,
}

impl SyncEvent {
    /// Wraps a message, taking the account from the message itself.
    pub fn new(message: NormalizedMessage) -> Self {
        Self {
            account_id: message.account_id.clone(),
            message,
        }
    }

    /// Returns the dedup key of the carried message.
    pub fn dedup_key(&self) -> DedupKey {
        self.message.dedup_key()
    }
}
