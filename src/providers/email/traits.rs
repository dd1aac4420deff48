//! Mail transport trait definitions.
//!
//! This module defines the seam between the sync core and a concrete mail
//! server protocol. A [`MailConnector`] opens authenticated sessions; a
//! [`MailSession`] is exclusively owned by one connection manager and is
//! discarded, never repaired, after any error.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::domain::Account;

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors that can occur while talking to a mail server.
///
/// Every variant ends the current session and triggers a full reconnect of
/// that account.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Credentials were rejected. Retrying cannot succeed without operator action.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Network or connection error.
    #[error("connection error: {0}")]
    Connection(String),

    /// The server sent something we could not decode, or refused a command.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Returns true for credential rejections.
    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::Authentication(_))
    }
}

/// Folder state observed when a folder is selected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MailboxSnapshot {
    /// Number of messages in the folder.
    pub exists: u32,
    /// UID the next delivered message will receive, if advertised.
    pub uid_next: Option<u32>,
    /// UIDVALIDITY of the folder, if advertised.
    pub uid_validity: Option<u32>,
}

impl MailboxSnapshot {
    /// Highest UID that existed when the snapshot was taken, if known.
    pub fn last_uid(&self) -> Option<u32> {
        self.uid_next
            .and_then(|next| next.checked_sub(1))
            .filter(|uid| *uid > 0)
    }
}

/// A message fetched from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedMessage {
    /// Server-assigned UID.
    pub uid: u32,
    /// Arrival time recorded by the server.
    pub internal_date: Option<DateTime<Utc>>,
    /// Raw RFC 5322 payload.
    pub raw: Vec<u8>,
}

/// Outcome of one change-notification wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleEvent {
    /// The folder gained at least one message.
    NewMessage,
    /// A message was removed from the folder.
    MessageRemoved,
    /// The server sent something unrelated to folder size.
    Unsolicited,
    /// The wait reached its timeout; a keep-alive is due.
    KeepAliveDue,
    /// The cancellation token fired.
    Interrupted,
}

/// Opens authenticated sessions for accounts.
#[async_trait]
pub trait MailConnector: Send + Sync {
    /// Connects and authenticates a fresh session for `account`.
    async fn connect(&self, account: &Account) -> Result<Box<dyn MailSession>>;
}

/// One authenticated connection to a mail server.
#[async_trait]
pub trait MailSession: Send {
    /// Selects `folder` and returns its current state.
    async fn select(&mut self, folder: &str) -> Result<MailboxSnapshot>;

    /// Returns UIDs of messages that arrived on or after the day of `since`.
    ///
    /// Servers compare dates at day granularity; callers filter precisely on
    /// [`FetchedMessage::internal_date`].
    async fn search_since(&mut self, since: DateTime<Utc>) -> Result<Vec<u32>>;

    /// Returns UIDs strictly greater than `uid`.
    async fn search_after(&mut self, uid: u32) -> Result<Vec<u32>>;

    /// Fetches one message by UID. `None` when it no longer exists.
    async fn fetch(&mut self, uid: u32) -> Result<Option<FetchedMessage>>;

    /// Waits for a change notification on the selected folder.
    ///
    /// Returns [`IdleEvent::KeepAliveDue`] after `timeout` and
    /// [`IdleEvent::Interrupted`] promptly once `cancel` fires, leaving the
    /// session usable for a graceful logout.
    async fn idle(&mut self, timeout: Duration, cancel: &CancellationToken) -> Result<IdleEvent>;

    /// Sends a keep-alive so the server does not drop an idle connection.
    async fn keep_alive(&mut self) -> Result<()>;

    /// Logs out and closes the connection.
    async fn logout(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_last_uid() {
        let snapshot = MailboxSnapshot {
            exists: 3,
            uid_next: Some(42),
            uid_validity: Some(1),
        };
        assert_eq!(snapshot.last_uid(), Some(41));
    }

    #[test]
    fn empty_folder_has_no_last_uid() {
        let fresh = MailboxSnapshot {
            exists: 0,
            uid_next: Some(1),
            uid_validity: Some(1),
        };
        assert_eq!(fresh.last_uid(), None);
        assert_eq!(MailboxSnapshot::default().last_uid(), None);
    }

    #[test]
    fn authentication_errors_are_flagged() {
        assert!(TransportError::Authentication("bad".into()).is_authentication());
        assert!(!TransportError::Connection("reset".into()).is_authentication());
    }
}
