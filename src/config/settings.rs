//! Settings and configuration types.
//!
//! Settings are read from `settings.json` in the platform config directory
//! (or a path given on the command line), then selectively overridden from
//! the environment. A missing file yields defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::domain::{AccountConfig, EmailLabel};
use crate::storage::SecretSource;

/// Environment variable holding a JSON array of account descriptors.
pub const ENV_ACCOUNTS: &str = "IMAP_ACCOUNTS";
/// Environment variable holding the Slack incoming-webhook URL.
pub const ENV_SLACK_WEBHOOK: &str = "SLACK_WEBHOOK_URL";
/// Environment variable holding the generic webhook URL.
pub const ENV_WEBHOOK: &str = "WEBHOOK_SITE_URL";
/// Environment variable overriding the database path.
pub const ENV_DATABASE: &str = "MAILSYNC_DATABASE";

/// Errors raised while loading settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;

/// Top-level settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Accounts to sync, in order.
    pub accounts: Vec<AccountConfig>,
    /// Sync timing and channel settings.
    pub sync: SyncSettings,
    /// Webhook notification settings.
    pub notifications: NotificationSettings,
    /// Local storage settings.
    pub storage: StorageSettings,
}

/// Settings for the sync core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Folder synced on every account.
    pub folder: String,
    /// Days of history fetched by the initial backfill.
    pub lookback_days: u32,
    /// Recency window used when fetching new mail without a known folder state.
    pub recent_window_secs: u64,
    /// Interval between keep-alives while listening.
    pub keepalive_secs: u64,
    /// Delay between a failed session and the next connect attempt.
    pub reconnect_delay_secs: u64,
    /// Capacity of the shared event channel.
    pub event_buffer: usize,
    /// How long shutdown waits for managers before aborting them.
    pub shutdown_timeout_secs: u64,
    /// Number of recent dedup keys remembered by the sink.
    pub dedup_capacity: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            folder: "INBOX".to_string(),
            lookback_days: 30,
            recent_window_secs: 60,
            keepalive_secs: 300, // 5 minutes
            reconnect_delay_secs: 5,
            event_buffer: 256,
            shutdown_timeout_secs: 10,
            dedup_capacity: 4096,
        }
    }
}

impl SyncSettings {
    /// Shutdown deadline as a [`Duration`].
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Webhook notification settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    /// Slack incoming-webhook URL.
    pub slack_webhook_url: Option<Url>,
    /// Generic webhook receiving a JSON payload per notified message.
    pub webhook_url: Option<Url>,
    /// Label that triggers notifications.
    pub notify_label: EmailLabel,
    /// Per-request timeout.
    pub timeout_secs: u64,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            slack_webhook_url: None,
            webhook_url: None,
            notify_label: EmailLabel::Interested,
            timeout_secs: 10,
        }
    }
}

impl NotificationSettings {
    /// Returns true when at least one webhook is configured.
    pub fn is_enabled(&self) -> bool {
        self.slack_webhook_url.is_some() || self.webhook_url.is_some()
    }
}

/// Local storage settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// SQLite database path. Defaults to the platform data directory.
    pub database_path: Option<PathBuf>,
}

impl StorageSettings {
    /// Returns the configured path, or the default under the data directory.
    pub fn resolved_database_path(&self) -> PathBuf {
        self.database_path.clone().unwrap_or_else(|| {
            project_dirs()
                .map(|dirs| dirs.data_dir().join("mailsync.db"))
                .unwrap_or_else(|| PathBuf::from("mailsync.db"))
        })
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("io", "mailsync", "mailsync")
}

impl Settings {
    /// Default settings file location, if the platform has a config directory.
    pub fn default_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join("settings.json"))
    }

    /// Loads settings from `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        serde_json::from_str(&contents).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads settings from `path`, returning defaults when the file does not exist.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!(path = %path.display(), "No settings file, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Applies overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Applies overrides read through `lookup`.
    ///
    /// A parseable `IMAP_ACCOUNTS` array replaces the configured accounts;
    /// entries that are not valid descriptors are skipped.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(raw) = lookup(ENV_ACCOUNTS) {
            self.accounts = parse_accounts(&raw);
        }

        if let Some(url) = lookup(ENV_SLACK_WEBHOOK).and_then(|v| parse_url(ENV_SLACK_WEBHOOK, &v)) {
            self.notifications.slack_webhook_url = Some(url);
        }

        if let Some(url) = lookup(ENV_WEBHOOK).and_then(|v| parse_url(ENV_WEBHOOK, &v)) {
            self.notifications.webhook_url = Some(url);
        }

        if let Some(path) = lookup(ENV_DATABASE).filter(|v| !v.trim().is_empty()) {
            self.storage.database_path = Some(PathBuf::from(path));
        }
    }

    /// Fills in missing account secrets from `source`.
    ///
    /// Lookup failures are logged and leave the secret empty, so the account
    /// is later skipped as incomplete.
    pub async fn resolve_secrets(&mut self, source: &dyn SecretSource) {
        for account in &mut self.accounts {
            if account.secret.as_deref().is_some_and(|s| !s.is_empty()) {
                continue;
            }
            let Some(id) = account.id.clone() else {
                continue;
            };

            match source.imap_password(&id).await {
                Ok(Some(secret)) => {
                    tracing::debug!(account_id = %id, "Resolved secret from keychain");
                    account.secret = Some(secret);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(account_id = %id, error = %e, "Keychain lookup failed");
                }
            }
        }
    }
}

fn parse_accounts(raw: &str) -> Vec<AccountConfig> {
    let entries: Vec<serde_json::Value> = match serde_json::from_str(raw) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(error = %e, "{} is not a JSON array, ignoring it", ENV_ACCOUNTS);
            return Vec::new();
        }
    };

    entries
        .into_iter()
        .enumerate()
        .filter_map(|(index, entry)| match serde_json::from_value(entry) {
            Ok(account) => Some(account),
            Err(e) => {
                tracing::warn!(index, error = %e, "Skipping malformed account descriptor");
                None
            }
        })
        .collect()
}

fn parse_url(name: &str, value: &str) -> Option<Url> {
    if value.trim().is_empty() {
        return None;
    }
    match Url::parse(value.trim()) {
        Ok(url) => Some(url),
        Err(e) => {
            tracing::warn!(variable = name, error = %e, "Ignoring invalid URL");
            None
        }
    }
}
