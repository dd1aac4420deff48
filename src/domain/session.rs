//! Session lifecycle types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle mode of one account's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// Opening the transport and authenticating.
    Connecting,
    /// Catching up on the lookback window.
    Backfilling,
    /// Steady state: handling notifications and fetching new mail.
    Listening,
    /// Blocked in the server-push wait.
    IdleWait,
    /// Session discarded; waiting before the next connect attempt.
    Reconnecting,
    /// Terminal. Entered only on shutdown.
    Closed,
}

impl SessionMode {
    /// Returns true when the mode implies a live, authenticated session.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Backfilling | Self::Listening | Self::IdleWait)
    }
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Backfilling => "backfilling",
            Self::Listening => "listening",
            Self::IdleWait => "idle_wait",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Status projection of one account, as held by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    /// Current mode.
    pub mode: SessionMode,
    /// Last time the session changed mode or saw transport activity.
    pub last_activity: DateTime<Utc>,
}

impl SessionStatus {
    /// Creates a status stamped with the current time.
    pub fn now(mode: SessionMode) -> Self {
        Self {
            mode,
            last_activity: Utc::now(),
        }
    }
}
