//! In-process mail transport.
//!
//! [`MemoryTransport`] keeps one [`MemoryMailbox`] per account and hands out
//! sessions that behave like IMAP sessions: UIDs are assigned on delivery,
//! IDLE wakes on folder size changes, and severed connections fail on their
//! next operation. Faults can be injected to exercise reconnect paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use super::{
    FetchedMessage, IdleEvent, MailConnector, MailSession, MailboxSnapshot, Result,
    TransportError,
};
use crate::domain::{Account, AccountId};

const DEFAULT_FOLDER: &str = "INBOX";

#[derive(Debug, Clone)]
struct StoredMessage {
    uid: u32,
    internal_date: DateTime<Utc>,
    raw: Vec<u8>,
}

#[derive(Debug)]
struct MailboxState {
    folders: HashMap<String, Vec<StoredMessage>>,
    next_uid: u32,
    generation: u64,
}

impl Default for MailboxState {
    fn default() -> Self {
        Self {
            folders: HashMap::from([(DEFAULT_FOLDER.to_string(), Vec::new())]),
            next_uid: 1,
            generation: 0,
        }
    }
}

/// Server-side state of one account.
#[derive(Debug)]
pub struct MemoryMailbox {
    state: Mutex<MailboxState>,
    changes: watch::Sender<u64>,
    reject_auth: AtomicBool,
    connect_failures: AtomicU32,
    connects: AtomicU32,
    logouts: AtomicU32,
    keep_alives: AtomicU32,
}

impl MemoryMailbox {
    fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            state: Mutex::new(MailboxState::default()),
            changes,
            reject_auth: AtomicBool::new(false),
            connect_failures: AtomicU32::new(0),
            connects: AtomicU32::new(0),
            logouts: AtomicU32::new(0),
            keep_alives: AtomicU32::new(0),
        }
    }

    fn notify(&self) {
        self.changes.send_modify(|version| *version += 1);
    }

    /// Appends a message to `folder` and returns its UID.
    pub async fn deliver(
        &self,
        folder: &str,
        raw: impl Into<Vec<u8>>,
        internal_date: DateTime<Utc>,
    ) -> u32 {
        let uid = {
            let mut state = self.state.lock().await;
            let uid = state.next_uid;
            state.next_uid += 1;
            state
                .folders
                .entry(folder.to_string())
                .or_default()
                .push(StoredMessage {
                    uid,
                    internal_date,
                    raw: raw.into(),
                });
            uid
        };
        self.notify();
        uid
    }

    /// Removes a message. Returns false when it did not exist.
    pub async fn expunge(&self, folder: &str, uid: u32) -> bool {
        let removed = {
            let mut state = self.state.lock().await;
            match state.folders.get_mut(folder) {
                Some(messages) => {
                    let before = messages.len();
                    messages.retain(|m| m.uid != uid);
                    messages.len() != before
                }
                None => false,
            }
        };
        if removed {
            self.notify();
        }
        removed
    }

    /// Drops every open session; each fails on its next operation.
    pub async fn sever(&self) {
        self.state.lock().await.generation += 1;
        self.notify();
    }

    /// Makes the next `count` connection attempts fail with a network error.
    pub fn fail_next_connects(&self, count: u32) {
        self.connect_failures.store(count, Ordering::SeqCst);
    }

    /// Rejects (or accepts again) every login attempt.
    pub fn reject_auth(&self, reject: bool) {
        self.reject_auth.store(reject, Ordering::SeqCst);
    }

    /// Number of successful logins so far.
    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    /// Number of logouts so far.
    pub fn logout_count(&self) -> u32 {
        self.logouts.load(Ordering::SeqCst)
    }

    /// Number of keep-alives received so far.
    pub fn keep_alive_count(&self) -> u32 {
        self.keep_alives.load(Ordering::SeqCst)
    }
}

/// Connector over in-process mailboxes, keyed by account id.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    mailboxes: Arc<RwLock<HashMap<AccountId, Arc<MemoryMailbox>>>>,
}

impl MemoryTransport {
    /// Creates a transport with no mailboxes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the mailbox for `account_id`, creating an empty one if needed.
    pub async fn mailbox(&self, account_id: &AccountId) -> Arc<MemoryMailbox> {
        if let Some(mailbox) = self.mailboxes.read().await.get(account_id) {
            return Arc::clone(mailbox);
        }
        let mut mailboxes = self.mailboxes.write().await;
        Arc::clone(
            mailboxes
                .entry(account_id.clone())
                .or_insert_with(|| Arc::new(MemoryMailbox::new())),
        )
    }
}

#[async_trait]
impl MailConnector for MemoryTransport {
    async fn connect(&self, account: &Account) -> Result<Box<dyn MailSession>> {
        let mailbox = self.mailbox(&account.id).await;

        let pending_failures = mailbox
            .connect_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if pending_failures.is_ok() {
            return Err(TransportError::Connection(
                "connection refused".to_string(),
            ));
        }

        if mailbox.reject_auth.load(Ordering::SeqCst) {
            return Err(TransportError::Authentication(
                "invalid credentials".to_string(),
            ));
        }

        let generation = mailbox.state.lock().await.generation;
        let changes = mailbox.changes.subscribe();
        mailbox.connects.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(MemorySession {
            mailbox,
            generation,
            changes,
            selected: None,
            known_exists: 0,
            closed: false,
        }))
    }
}

/// A session over a [`MemoryMailbox`].
pub struct MemorySession {
    mailbox: Arc<MemoryMailbox>,
    generation: u64,
    changes: watch::Receiver<u64>,
    selected: Option<String>,
    known_exists: usize,
    closed: bool,
}

impl MemorySession {
    /// Runs `f` over the selected folder, failing if the session was severed.
    async fn with_folder<T>(&self, f: impl FnOnce(&[StoredMessage]) -> T) -> Result<T> {
        let state = self.mailbox.state.lock().await;
        if self.closed || state.generation != self.generation {
            return Err(TransportError::Connection(
                "connection reset by peer".to_string(),
            ));
        }
        let folder = self
            .selected
            .as_deref()
            .ok_or_else(|| TransportError::Protocol("no folder selected".to_string()))?;
        let messages = state
            .folders
            .get(folder)
            .map(Vec::as_slice)
            .unwrap_or_default();
        Ok(f(messages))
    }

    /// Compares the folder size with what this session last reported.
    async fn pending_change(&mut self) -> Result<Option<IdleEvent>> {
        let exists = self.with_folder(<[StoredMessage]>::len).await?;
        let event = if exists > self.known_exists {
            Some(IdleEvent::NewMessage)
        } else if exists < self.known_exists {
            Some(IdleEvent::MessageRemoved)
        } else {
            None
        };
        self.known_exists = exists;
        Ok(event)
    }
}

#[async_trait]
impl MailSession for MemorySession {
    async fn select(&mut self, folder: &str) -> Result<MailboxSnapshot> {
        let state = self.mailbox.state.lock().await;
        if self.closed || state.generation != self.generation {
            return Err(TransportError::Connection(
                "connection reset by peer".to_string(),
            ));
        }
        let messages = state
            .folders
            .get(folder)
            .ok_or_else(|| TransportError::Protocol(format!("no such mailbox: {}", folder)))?;

        let snapshot = MailboxSnapshot {
            exists: messages.len() as u32,
            uid_next: Some(state.next_uid),
            uid_validity: Some(1),
        };
        self.known_exists = messages.len();
        self.selected = Some(folder.to_string());
        Ok(snapshot)
    }

    async fn search_since(&mut self, since: DateTime<Utc>) -> Result<Vec<u32>> {
        // Day granularity, like IMAP SEARCH SINCE.
        let day = since.date_naive();
        self.with_folder(|messages| {
            messages
                .iter()
                .filter(|m| m.internal_date.date_naive() >= day)
                .map(|m| m.uid)
                .collect()
        })
        .await
    }

    async fn search_after(&mut self, uid: u32) -> Result<Vec<u32>> {
        self.with_folder(|messages| {
            messages
                .iter()
                .filter(|m| m.uid > uid)
                .map(|m| m.uid)
                .collect()
        })
        .await
    }

    async fn fetch(&mut self, uid: u32) -> Result<Option<FetchedMessage>> {
        self.with_folder(|messages| {
            messages.iter().find(|m| m.uid == uid).map(|m| FetchedMessage {
                uid: m.uid,
                internal_date: Some(m.internal_date),
                raw: m.raw.clone(),
            })
        })
        .await
    }

    async fn idle(&mut self, timeout: Duration, cancel: &CancellationToken) -> Result<IdleEvent> {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            self.changes.borrow_and_update();
            if let Some(event) = self.pending_change().await? {
                return Ok(event);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(IdleEvent::Interrupted),
                _ = &mut deadline => return Ok(IdleEvent::KeepAliveDue),
                changed = self.changes.changed() => {
                    if changed.is_err() {
                        return Err(TransportError::Connection("server went away".to_string()));
                    }
                }
            }
        }
    }

    async fn keep_alive(&mut self) -> Result<()> {
        self.with_folder(|_| ()).await?;
        self.mailbox.keep_alives.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn logout(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.mailbox.logouts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
