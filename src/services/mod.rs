//! Sync and downstream services.
//!
//! # Architecture
//!
//! ```text
//!   SyncOrchestrator
//!     |  one task per account
//!     v
//!   ConnectionManager --(MailConnector/MailSession)--> mail server
//!     |  SyncEvent, bounded channel
//!     v
//!   SinkWorker --> IndexingSink --> storage, Classifier, Notifier
//! ```
//!
//! # Services Overview
//!
//! - [`SyncOrchestrator`]: starts, steers and stops the per-account managers
//! - [`ConnectionManager`]: owns one account's session and its reconnect loop
//! - [`SinkWorker`]: deduplicating consumer of the event channel
//! - [`IndexingSink`]: persists, classifies and notifies
//! - [`WebhookNotifier`]: Slack and generic webhook delivery

mod classification;
mod connection_manager;
mod event_sink;
mod notification_service;
mod sync_service;

pub use classification::{Classifier, KeywordClassifier, BODY_SAMPLE_CHARS};
pub use connection_manager::{ConnectionManager, ManagerConfig, ManagerControl, StatusTable};
pub use event_sink::{EventSink, IndexingSink, SinkStats, SinkWorker};
pub use notification_service::{
    slack_payload, Notifier, NotifyError, NotifyResult, WebhookNotifier, WebhookPayload,
};
pub use sync_service::{StartReport, SyncError, SyncOrchestrator};
