//! Multi-account sync orchestration.
//!
//! The [`SyncOrchestrator`] starts one [`ConnectionManager`] task per valid
//! account, routes operator reconnect requests to them, projects their
//! session modes into a status table and shuts them all down within a
//! deadline. All managers share a single bounded output channel; events are
//! ordered per account only.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::connection_manager::{ConnectionManager, ManagerConfig, ManagerControl, StatusTable};
use crate::config::SyncSettings;
use crate::domain::{
    Account, AccountConfig, AccountId, ConfigError, SessionMode, SessionStatus, SyncEvent,
};
use crate::providers::email::MailConnector;

/// Deadline used when the configured shutdown timeout is out of range.
const MAX_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3600);

/// Errors surfaced by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Every descriptor was invalid, so nothing could start.
    #[error("no valid accounts to start ({} skipped)", .skipped.len())]
    NoValidAccounts { skipped: Vec<ConfigError> },

    #[error("unknown account: {0}")]
    UnknownAccount(AccountId),

    /// Some managers did not stop before the deadline and were aborted.
    #[error("shutdown timed out waiting for {} account(s)", .pending.len())]
    ShutdownTimeout { pending: Vec<AccountId> },

    #[error("orchestrator has been shut down")]
    ShutDown,
}

/// Result type alias for orchestrator operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Outcome of [`SyncOrchestrator::start_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartReport {
    /// Accounts whose managers were started, in descriptor order.
    pub started: Vec<AccountId>,
    /// Descriptors that were skipped, with the reason.
    pub skipped: Vec<ConfigError>,
}

struct Worker {
    control: ManagerControl,
    handle: JoinHandle<()>,
}

/// Coordinates the connection managers of all accounts.
pub struct SyncOrchestrator {
    connector: Arc<dyn MailConnector>,
    config: ManagerConfig,
    shutdown_timeout: Duration,
    events: Mutex<Option<mpsc::Sender<SyncEvent>>>,
    status: StatusTable,
    shutdown: CancellationToken,
    workers: Mutex<HashMap<AccountId, Worker>>,
}

impl SyncOrchestrator {
    /// Creates an orchestrator and the receiving end of its event channel.
    pub fn new(
        connector: Arc<dyn MailConnector>,
        settings: &SyncSettings,
    ) -> (Self, mpsc::Receiver<SyncEvent>) {
        Self::with_config(
            connector,
            ManagerConfig::from(settings),
            settings.event_buffer,
            settings.shutdown_timeout(),
        )
    }

    /// Creates an orchestrator with explicit manager timings.
    pub fn with_config(
        connector: Arc<dyn MailConnector>,
        config: ManagerConfig,
        event_buffer: usize,
        shutdown_timeout: Duration,
    ) -> (Self, mpsc::Receiver<SyncEvent>) {
        let (tx, rx) = mpsc::channel(event_buffer.max(1));
        let orchestrator = Self {
            connector,
            config,
            shutdown_timeout,
            events: Mutex::new(Some(tx)),
            status: StatusTable::default(),
            shutdown: CancellationToken::new(),
            workers: Mutex::new(HashMap::new()),
        };
        (orchestrator, rx)
    }

    /// Validates `accounts` and starts one manager per valid descriptor.
    ///
    /// Invalid and duplicate descriptors are skipped and reported. Fails only
    /// when no descriptor is valid.
    pub async fn start_all(&self, accounts: &[AccountConfig]) -> Result<StartReport> {
        let events = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(SyncError::ShutDown)?;

        let mut report = StartReport::default();
        let mut valid = Vec::new();
        let mut seen: HashSet<AccountId> = self.lock_workers().keys().cloned().collect();

        for config in accounts {
            let account = match Account::try_from(config) {
                Ok(account) => account,
                Err(e) => {
                    tracing::warn!(account = %e.account(), error = %e, "Skipping account");
                    report.skipped.push(e);
                    continue;
                }
            };

            if !seen.insert(account.id.clone()) {
                let e = ConfigError::DuplicateId {
                    account: account.id.to_string(),
                };
                tracing::warn!(account = %account.id, error = %e, "Skipping account");
                report.skipped.push(e);
                continue;
            }

            valid.push(account);
        }

        if valid.is_empty() {
            tracing::error!(skipped = report.skipped.len(), "No valid accounts configured");
            return Err(SyncError::NoValidAccounts {
                skipped: report.skipped,
            });
        }

        for account in valid {
            let account_id = account.id.clone();
            self.status
                .write()
                .await
                .insert(account_id.clone(), SessionStatus::now(SessionMode::Connecting));

            let manager = ConnectionManager::new(
                account,
                Arc::clone(&self.connector),
                self.config.clone(),
                events.clone(),
                Arc::clone(&self.status),
                self.shutdown.child_token(),
            );
            let control = manager.control();
            let handle = tokio::spawn(manager.run());

            self.lock_workers()
                .insert(account_id.clone(), Worker { control, handle });
            report.started.push(account_id);
        }

        tracing::info!(
            started = report.started.len(),
            skipped = report.skipped.len(),
            "Sync started"
        );
        Ok(report)
    }

    /// Forces the account's manager to drop its session and reconnect now.
    pub fn reconnect(&self, account_id: &AccountId) -> Result<()> {
        let workers = self.lock_workers();
        let worker = workers
            .get(account_id)
            .ok_or_else(|| SyncError::UnknownAccount(account_id.clone()))?;

        tracing::info!(account_id = %account_id, "Forcing reconnect");
        worker.control.request_reconnect();
        Ok(())
    }

    /// Forces every manager to reconnect.
    pub fn reconnect_all(&self) {
        let workers = self.lock_workers();
        tracing::info!(accounts = workers.len(), "Forcing reconnect of all accounts");
        for worker in workers.values() {
            worker.control.request_reconnect();
        }
    }

    /// Returns the accounts that currently hold a live session.
    pub async fn status(&self) -> BTreeSet<AccountId> {
        self.status
            .read()
            .await
            .iter()
            .filter(|(_, status)| status.mode.is_live())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Returns the current mode of every account that was started.
    pub async fn modes(&self) -> HashMap<AccountId, SessionStatus> {
        self.status.read().await.clone()
    }

    /// Stops every manager, releasing all sessions.
    ///
    /// Managers still running at the deadline are aborted and reported in
    /// [`SyncError::ShutdownTimeout`]. Once every manager is gone the event
    /// channel closes, letting the consumer drain and finish.
    pub async fn shutdown_all(&self) -> Result<()> {
        tracing::info!("Shutting down sync");
        self.shutdown.cancel();
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let workers: Vec<(AccountId, Worker)> = self.lock_workers().drain().collect();
        let now = tokio::time::Instant::now();
        let deadline = now
            .checked_add(self.shutdown_timeout)
            .unwrap_or_else(|| now + MAX_SHUTDOWN_TIMEOUT);
        let mut pending = Vec::new();

        for (account_id, mut worker) in workers {
            match tokio::time::timeout_at(deadline, &mut worker.handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(account_id = %account_id, error = %e, "Connection manager panicked");
                }
                Err(_) => {
                    worker.handle.abort();
                    self.status
                        .write()
                        .await
                        .insert(account_id.clone(), SessionStatus::now(SessionMode::Closed));
                    pending.push(account_id);
                }
            }
        }

        if pending.is_empty() {
            tracing::info!("Sync stopped");
            Ok(())
        } else {
            pending.sort();
            tracing::error!(pending = ?pending, "Shutdown timed out; aborted remaining managers");
            Err(SyncError::ShutdownTimeout { pending })
        }
    }

    fn lock_workers(&self) -> std::sync::MutexGuard<'_, HashMap<AccountId, Worker>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SyncOrchestrator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
