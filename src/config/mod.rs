//! Configuration and settings management.
//!
//! This module provides settings types, JSON persistence and environment
//! overrides.

mod settings;

pub use settings::{
    NotificationSettings, Settings, SettingsError, StorageSettings, SyncSettings, ENV_ACCOUNTS,
    ENV_DATABASE, ENV_SLACK_WEBHOOK, ENV_WEBHOOK,
};
