//! Account domain types.
//!
//! An [`AccountConfig`] is the raw descriptor as it appears in settings or the
//! environment; every field may be missing. An [`Account`] is the validated,
//! immutable form the sync core works with.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::AccountId;

/// Default IMAP port with implicit TLS.
pub const IMAPS_PORT: u16 = 993;

/// Default IMAP port without transport security.
pub const IMAP_PORT: u16 = 143;

/// Errors raised while validating an account descriptor.
///
/// A descriptor that fails validation is skipped; other accounts still start.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("account {account}: missing required field `{field}`")]
    MissingField {
        account: String,
        field: &'static str,
    },

    #[error("account {account}: port 0 is not valid")]
    InvalidPort { account: String },

    #[error("account {account}: duplicate account id")]
    DuplicateId { account: String },
}

impl ConfigError {
    /// Returns the account label this error refers to.
    pub fn account(&self) -> &str {
        match self {
            Self::MissingField { account, .. }
            | Self::InvalidPort { account }
            | Self::DuplicateId { account } => account,
        }
    }
}

/// Raw account descriptor.
///
/// Field aliases match the `IMAP_ACCOUNTS` format of earlier deployments
/// (`user`, `pass`, `tls`).
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Unique account identifier.
    #[serde(default)]
    pub id: Option<String>,
    /// IMAP server hostname.
    #[serde(default)]
    pub host: Option<String>,
    /// IMAP server port; defaults from `use_tls` when absent.
    #[serde(default)]
    pub port: Option<u16>,
    /// Login name.
    #[serde(default, alias = "user")]
    pub username: Option<String>,
    /// Password or app-specific password. May be resolved from the keychain.
    #[serde(
        default,
        alias = "pass",
        alias = "password",
        skip_serializing_if = "Option::is_none"
    )]
    pub secret: Option<String>,
    /// Whether to use implicit TLS.
    #[serde(default = "default_use_tls", alias = "tls")]
    pub use_tls: bool,
}

fn default_use_tls() -> bool {
    true
}

impl AccountConfig {
    /// Label used in logs and errors, even when the id is missing.
    pub fn label(&self) -> String {
        non_blank(&self.id)
            .map(str::to_string)
            .unwrap_or_else(|| "<unnamed>".to_string())
    }
}

impl fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountConfig")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("use_tls", &self.use_tls)
            .finish()
    }
}

/// A validated mailbox account. Immutable once constructed.
#[derive(Clone, PartialEq, Eq)]
pub struct Account {
    /// Unique identifier.
    pub id: AccountId,
    /// IMAP server hostname.
    pub host: String,
    /// IMAP server port.
    pub port: u16,
    /// Login name.
    pub username: String,
    secret: String,
    /// Whether to use implicit TLS.
    pub use_tls: bool,
}

impl Account {
    /// Creates an account from already-validated parts.
    pub fn new(
        id: impl Into<AccountId>,
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        secret: impl Into<String>,
        use_tls: bool,
    ) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            username: username.into(),
            secret: secret.into(),
            use_tls,
        }
    }

    /// Returns the login secret.
    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("use_tls", &self.use_tls)
            .finish_non_exhaustive()
    }
}

impl TryFrom<&AccountConfig> for Account {
    type Error = ConfigError;

    fn try_from(config: &AccountConfig) -> Result<Self, Self::Error> {
        let label = config.label();
        let missing = |field| ConfigError::MissingField {
            account: label.clone(),
            field,
        };

        let id = non_blank(&config.id).ok_or_else(|| missing("id"))?;
        let host = non_blank(&config.host).ok_or_else(|| missing("host"))?;
        let username = non_blank(&config.username).ok_or_else(|| missing("username"))?;
        let secret = config
            .secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| missing("secret"))?;

        let port = match config.port {
            Some(0) => return Err(ConfigError::InvalidPort { account: label }),
            Some(port) => port,
            None if config.use_tls => IMAPS_PORT,
            None => IMAP_PORT,
        };

        Ok(Self::new(id, host, port, username, secret, config.use_tls))
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}
