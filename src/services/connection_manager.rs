//! Per-account connection manager.
//!
//! A [`ConnectionManager`] owns the session of exactly one account and drives
//! it through its lifecycle:
//!
//! ```text
//! Connecting -> Backfilling -> Listening <-> IdleWait
//!      ^                            |
//!      +------- Reconnecting <------+   (any transport error)
//! ```
//!
//! Sessions are never repaired: any transport error releases the current
//! session and a fresh one is opened after the reconnect delay. Shutdown and
//! operator reconnect requests are delivered through cancellation tokens held
//! by a [`ManagerControl`], so every wait (connect, fetch, IDLE, a blocked
//! send on the output channel) is interruptible.

use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::SyncSettings;
use crate::domain::{Account, AccountId, MessageId, SessionMode, SessionStatus, SyncEvent};
use crate::providers::email::{normalize, IdleEvent, MailConnector, MailSession, TransportError};

/// Upper bound on the best-effort logout when a session is released.
const LOGOUT_TIMEOUT: Duration = Duration::from_secs(2);

/// How long a transport may take to leave IDLE once the session is cancelled.
const IDLE_EXIT_GRACE: Duration = Duration::from_secs(3);

/// Message ids remembered per session once backfill is done.
const EMITTED_CAPACITY: usize = 8192;

/// Shared account -> status table, written by managers and read by the orchestrator.
pub type StatusTable = Arc<RwLock<HashMap<AccountId, SessionStatus>>>;

/// Timing and folder parameters of a manager.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    /// Folder to sync.
    pub folder: String,
    /// How far back the initial backfill reaches.
    pub lookback: chrono::Duration,
    /// Window for new-message fetches when no folder state is known yet.
    pub recent_window: chrono::Duration,
    /// Interval between keep-alives while listening.
    pub keepalive: Duration,
    /// Delay between a failed session and the next connect attempt.
    pub reconnect_delay: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::from(&SyncSettings::default())
    }
}

impl From<&SyncSettings> for ManagerConfig {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            folder: settings.folder.clone(),
            lookback: chrono::Duration::try_days(i64::from(settings.lookback_days))
                .unwrap_or(chrono::Duration::MAX),
            recent_window: i64::try_from(settings.recent_window_secs)
                .ok()
                .and_then(chrono::Duration::try_seconds)
                .unwrap_or(chrono::Duration::MAX),
            keepalive: Duration::from_secs(settings.keepalive_secs),
            reconnect_delay: Duration::from_secs(settings.reconnect_delay_secs),
        }
    }
}

/// Handle for steering a running manager from outside its task.
#[derive(Debug, Clone)]
pub struct ManagerControl {
    shutdown: CancellationToken,
    session: Arc<Mutex<CancellationToken>>,
}

impl ManagerControl {
    fn new(shutdown: CancellationToken) -> Self {
        let session = shutdown.child_token();
        Self {
            shutdown,
            session: Arc::new(Mutex::new(session)),
        }
    }

    /// Ends the current session (or pending reconnect delay) immediately.
    pub fn request_reconnect(&self) {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }

    /// Stops the manager for good.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Returns true once shutdown was requested.
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Installs and returns the token for a new session.
    fn begin_session(&self) -> CancellationToken {
        let token = self.shutdown.child_token();
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = token.clone();
        token
    }
}

/// Why a session ended.
#[derive(Debug)]
enum Stop {
    /// Shutdown or an operator reconnect request.
    Interrupted,
    /// The transport failed.
    Failed(TransportError),
    /// Nobody is listening on the output channel anymore.
    SinkClosed,
}

impl From<TransportError> for Stop {
    fn from(err: TransportError) -> Self {
        Self::Failed(err)
    }
}

/// Start of a window reaching `span` back from now, never before the epoch.
fn window_start(span: chrono::Duration) -> DateTime<Utc> {
    let epoch = DateTime::<Utc>::UNIX_EPOCH;
    Utc::now()
        .checked_sub_signed(span)
        .map_or(epoch, |start| start.max(epoch))
}

/// Runs a transport call unless the session token fires first.
async fn guarded<T, F>(token: &CancellationToken, fut: F) -> Result<T, Stop>
where
    F: Future<Output = crate::providers::email::Result<T>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Stop::Interrupted),
        result = fut => result.map_err(Stop::from),
    }
}

/// Per-session bookkeeping. Dropped together with the session.
#[derive(Debug)]
struct SessionState {
    /// Highest UID seen in the folder.
    cursor: Option<u32>,
    /// Messages recently emitted by this session.
    emitted: LruCache<MessageId, ()>,
}

impl SessionState {
    fn new(cursor: Option<u32>) -> Self {
        Self {
            cursor,
            emitted: LruCache::new(Self::capacity(0)),
        }
    }

    fn capacity(extra: usize) -> NonZeroUsize {
        NonZeroUsize::new(EMITTED_CAPACITY.saturating_add(extra)).unwrap_or(NonZeroUsize::MIN)
    }

    /// Makes room for a batch so it is deduplicated in full.
    fn reserve(&mut self, batch: usize) {
        let needed = Self::capacity(batch);
        if needed > self.emitted.cap() {
            self.emitted.resize(needed);
        }
    }

    /// Records `id`, returning false when it was already emitted.
    fn remember(&mut self, id: &MessageId) -> bool {
        self.emitted.put(id.clone(), ()).is_none()
    }

    fn advance(&mut self, uid: u32) {
        self.cursor = Some(self.cursor.map_or(uid, |c| c.max(uid)));
    }
}

/// Owns the session of one account.
pub struct ConnectionManager {
    account: Account,
    connector: Arc<dyn MailConnector>,
    config: ManagerConfig,
    events: mpsc::Sender<SyncEvent>,
    status: StatusTable,
    control: ManagerControl,
}

impl ConnectionManager {
    /// Creates a manager. It does nothing until [`run`](Self::run) is awaited.
    pub fn new(
        account: Account,
        connector: Arc<dyn MailConnector>,
        config: ManagerConfig,
        events: mpsc::Sender<SyncEvent>,
        status: StatusTable,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            account,
            connector,
            config,
            events,
            status,
            control: ManagerControl::new(shutdown),
        }
    }

    /// Returns a handle for reconnect and shutdown requests.
    pub fn control(&self) -> ManagerControl {
        self.control.clone()
    }

    /// Runs sessions until shutdown or until the output channel closes.
    pub async fn run(self) {
        let account_id = self.account.id.clone();
        tracing::info!(account_id = %account_id, folder = %self.config.folder, "Connection manager started");

        while !self.control.is_shut_down() {
            let token = self.control.begin_session();

            match self.run_session(&token).await {
                Stop::SinkClosed => {
                    tracing::warn!(account_id = %account_id, "Event channel closed, stopping");
                    break;
                }
                Stop::Interrupted => {
                    if self.control.is_shut_down() {
                        break;
                    }
                    tracing::info!(account_id = %account_id, "Reconnect requested");
                    self.set_mode(SessionMode::Reconnecting).await;
                }
                Stop::Failed(err) => {
                    if err.is_authentication() {
                        tracing::error!(
                            account_id = %account_id,
                            error = %err,
                            "Authentication rejected; retrying, check the account credentials"
                        );
                    } else {
                        tracing::warn!(account_id = %account_id, error = %err, "Session failed");
                    }
                    self.set_mode(SessionMode::Reconnecting).await;

                    // An operator reconnect or shutdown cuts the delay short.
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                    }
                }
            }
        }

        self.set_mode(SessionMode::Closed).await;
        tracing::info!(account_id = %account_id, "Connection manager stopped");
    }

    /// Opens one session, drives it until it stops, then releases it.
    async fn run_session(&self, token: &CancellationToken) -> Stop {
        self.set_mode(SessionMode::Connecting).await;

        let mut session = match guarded(token, self.connector.connect(&self.account)).await {
            Ok(session) => session,
            Err(stop) => return stop,
        };

        let stop = match self.drive(session.as_mut(), token).await {
            Ok(never) => match never {},
            Err(stop) => stop,
        };

        match tokio::time::timeout(LOGOUT_TIMEOUT, session.logout()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(account_id = %self.account.id, error = %e, "Logout failed")
            }
            Err(_) => tracing::debug!(account_id = %self.account.id, "Logout timed out"),
        }

        stop
    }

    /// Backfills, then listens until something stops the session.
    async fn drive(
        &self,
        session: &mut dyn MailSession,
        token: &CancellationToken,
    ) -> Result<std::convert::Infallible, Stop> {
        let snapshot = guarded(token, session.select(&self.config.folder)).await?;

        let mut state = SessionState::new(snapshot.last_uid());

        self.set_mode(SessionMode::Backfilling).await;
        self.backfill(session, token, &mut state).await?;

        self.set_mode(SessionMode::Listening).await;
        // Catch anything that arrived while backfilling.
        self.fetch_new(session, token, &mut state).await?;

        loop {
            self.set_mode(SessionMode::IdleWait).await;
            // The transport handles cancellation itself; the grace bound
            // covers one that never gets out of IDLE.
            let event = tokio::select! {
                event = session.idle(self.config.keepalive, token) => event?,
                _ = async {
                    token.cancelled().await;
                    tokio::time::sleep(IDLE_EXIT_GRACE).await;
                } => {
                    tracing::warn!(account_id = %self.account.id, "IDLE did not end after cancellation");
                    return Err(Stop::Interrupted);
                }
            };
            self.set_mode(SessionMode::Listening).await;

            match event {
                IdleEvent::NewMessage => self.fetch_new(session, token, &mut state).await?,
                IdleEvent::KeepAliveDue => {
                    guarded(token, session.keep_alive()).await?;
                    tracing::debug!(account_id = %self.account.id, "Keep-alive sent");
                    self.fetch_new(session, token, &mut state).await?;
                }
                IdleEvent::MessageRemoved | IdleEvent::Unsolicited => {
                    tracing::debug!(account_id = %self.account.id, ?event, "Ignoring folder change");
                }
                IdleEvent::Interrupted => return Err(Stop::Interrupted),
            }
        }
    }

    /// Emits every message inside the lookback window, oldest UID first.
    async fn backfill(
        &self,
        session: &mut dyn MailSession,
        token: &CancellationToken,
        state: &mut SessionState,
    ) -> Result<(), Stop> {
        let cutoff = window_start(self.config.lookback);
        let mut uids = guarded(token, session.search_since(cutoff)).await?;
        uids.sort_unstable();
        state.reserve(uids.len());

        tracing::info!(
            account_id = %self.account.id,
            count = uids.len(),
            since = %cutoff,
            "Backfilling"
        );

        for uid in uids {
            self.deliver(session, token, state, uid, Some(cutoff)).await?;
        }
        Ok(())
    }

    /// Emits messages added since the last observed folder state.
    async fn fetch_new(
        &self,
        session: &mut dyn MailSession,
        token: &CancellationToken,
        state: &mut SessionState,
    ) -> Result<(), Stop> {
        let (mut uids, cutoff) = match state.cursor {
            Some(last) => (guarded(token, session.search_after(last)).await?, None),
            None => {
                let cutoff = window_start(self.config.recent_window);
                (guarded(token, session.search_since(cutoff)).await?, Some(cutoff))
            }
        };
        uids.sort_unstable();

        if !uids.is_empty() {
            tracing::debug!(account_id = %self.account.id, count = uids.len(), "New messages");
        }

        for uid in uids {
            self.deliver(session, token, state, uid, cutoff).await?;
        }
        Ok(())
    }

    /// Fetches, normalizes and emits one message.
    ///
    /// Vanished, out-of-window, unparseable and already emitted messages are
    /// skipped without ending the session.
    async fn deliver(
        &self,
        session: &mut dyn MailSession,
        token: &CancellationToken,
        state: &mut SessionState,
        uid: u32,
        cutoff: Option<DateTime<Utc>>,
    ) -> Result<(), Stop> {
        state.advance(uid);

        let Some(fetched) = guarded(token, session.fetch(uid)).await? else {
            tracing::debug!(account_id = %self.account.id, uid, "Message vanished before fetch");
            return Ok(());
        };

        if let (Some(cutoff), Some(date)) = (cutoff, fetched.internal_date) {
            if date < cutoff {
                return Ok(());
            }
        }

        let message = match normalize(&fetched.raw, &self.account.id, &self.config.folder) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(account_id = %self.account.id, uid, error = %e, "Skipping unparseable message");
                return Ok(());
            }
        };

        if !state.remember(&message.id) {
            tracing::debug!(account_id = %self.account.id, uid, message_id = %message.id, "Already emitted");
            return Ok(());
        }

        tracing::debug!(account_id = %self.account.id, uid, message_id = %message.id, "Emitting message");
        self.emit(SyncEvent::new(message), token).await
    }

    /// Sends on the bounded output channel, waiting for capacity.
    async fn emit(&self, event: SyncEvent, token: &CancellationToken) -> Result<(), Stop> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(Stop::Interrupted),
            sent = self.events.send(event) => sent.map_err(|_| Stop::SinkClosed),
        }
    }

    async fn set_mode(&self, mode: SessionMode) {
        let previous = self
            .status
            .write()
            .await
            .insert(self.account.id.clone(), SessionStatus::now(mode))
            .map(|s| s.mode);

        if previous != Some(mode) {
            tracing::trace!(account_id = %self.account.id, %mode, "Session mode changed");
        }
    }
}
