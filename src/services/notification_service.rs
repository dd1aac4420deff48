//! Webhook notifications.
//!
//! When the sink decides a message deserves attention it hands it to a
//! [`Notifier`]. [`WebhookNotifier`] posts to a Slack incoming webhook and to
//! a generic JSON webhook; either target may be left unconfigured.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use url::Url;

use crate::config::NotificationSettings;
use crate::domain::{EmailLabel, NormalizedMessage};

/// Errors that can occur while delivering notifications.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("{target} webhook request failed: {source}")]
    Request {
        target: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{target} webhook returned HTTP {status}")]
    Status { target: &'static str, status: u16 },
}

/// Result type for notification operations.
pub type NotifyResult<T> = std::result::Result<T, NotifyError>;

/// Delivers a notification about one message.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Notifies every configured target that `message` was labelled `label`.
    async fn notify(&self, message: &NormalizedMessage, label: EmailLabel) -> NotifyResult<()>;
}

/// Body posted to the generic webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub email_id: String,
    pub account_id: String,
    pub subject: String,
    pub from: String,
    pub label: EmailLabel,
    pub date: String,
}

impl WebhookPayload {
    /// Builds the payload for a labelled message.
    pub fn new(message: &NormalizedMessage, label: EmailLabel) -> Self {
        Self {
            email_id: message.id.to_string(),
            account_id: message.account_id.to_string(),
            subject: message.subject.clone(),
            from: message.from.display(),
            label,
            date: message.date.to_rfc3339(),
        }
    }
}

/// Builds a Slack incoming-webhook message with a markdown section.
pub fn slack_payload(message: &NormalizedMessage, label: EmailLabel) -> serde_json::Value {
    let from = message.from.display();
    serde_json::json!({
        "text": format!("New {} lead: {} from {}", label, message.subject, from),
        "blocks": [
            {
                "type": "section",
                "text": {
                    "type": "mrkdwn",
                    "text": format!(
                        "*New {} Lead*\n*Subject:* {}\n*From:* {}\n*Date:* {}",
                        label,
                        message.subject,
                        from,
                        message.date.format("%Y-%m-%d %H:%M UTC"),
                    ),
                },
            },
        ],
    })
}

/// Posts notifications to Slack and to a generic webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    slack_url: Option<Url>,
    webhook_url: Option<Url>,
}

impl WebhookNotifier {
    /// Creates a notifier for the targets in `settings`.
    pub fn new(settings: &NotificationSettings) -> NotifyResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(NotifyError::Client)?;

        Ok(Self {
            client,
            slack_url: settings.slack_webhook_url.clone(),
            webhook_url: settings.webhook_url.clone(),
        })
    }

    async fn post<T: Serialize + Sync>(
        &self,
        target: &'static str,
        url: Option<&Url>,
        body: &T,
    ) -> NotifyResult<()> {
        let Some(url) = url else {
            tracing::debug!(target_name = target, "Webhook not configured, skipping");
            return Ok(());
        };

        let response = self
            .client
            .post(url.clone())
            .json(body)
            .send()
            .await
            .map_err(|source| NotifyError::Request { target, source })?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status {
                target,
                status: status.as_u16(),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, message: &NormalizedMessage, label: EmailLabel) -> NotifyResult<()> {
        let slack = slack_payload(message, label);
        let generic = WebhookPayload::new(message, label);

        let (slack_result, webhook_result) = futures::join!(
            self.post("slack", self.slack_url.as_ref(), &slack),
            self.post("generic", self.webhook_url.as_ref(), &generic),
        );

        for result in [&slack_result, &webhook_result] {
            if let Err(e) = result {
                tracing::warn!(message_id = %message.id, error = %e, "Notification failed");
            }
        }

        if slack_result.is_ok() || webhook_result.is_ok() {
            tracing::info!(message_id = %message.id, %label, "Notification sent");
        }

        slack_result.and(webhook_result)
    }
}
