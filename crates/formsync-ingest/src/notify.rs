//! Run notifications
//!
//! Delivery is best effort: a failed notification is logged and never
//! changes the outcome of the run it reports on.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::summary::{RunStatus, RunSummary};

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Webhook returned HTTP {0}")]
    Status(reqwest::StatusCode),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub status: RunStatus,
    pub pipeline_name: String,
    pub details: String,
}

impl Notification {
    pub fn from_summary(summary: &RunSummary) -> Self {
        Self {
            status: summary.status,
            pipeline_name: summary.pipeline.clone(),
            details: summary.details(),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;

    /// Channel name used in logs
    fn channel_name(&self) -> &str;
}

/// Deliver a notification, logging instead of failing
pub async fn deliver(notifier: &dyn Notifier, notification: &Notification) {
    match notifier.send(notification).await {
        Ok(()) => info!(channel = notifier.channel_name(), status = %notification.status, "Sent run notification"),
        Err(e) => warn!(channel = notifier.channel_name(), error = %e, "Failed to send run notification"),
    }
}

/// Writes the notification to the log
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        match notification.status {
            RunStatus::Success => info!(
                pipeline = %notification.pipeline_name,
                status = %notification.status,
                details = %notification.details,
                "Ingestion run finished"
            ),
            RunStatus::PartialFailure | RunStatus::Failure => error!(
                pipeline = %notification.pipeline_name,
                status = %notification.status,
                details = %notification.details,
                "Ingestion run finished with failures"
            ),
        }
        Ok(())
    }

    fn channel_name(&self) -> &str {
        "log"
    }
}

/// Posts a Slack attachment to an incoming-webhook URL
#[derive(Debug)]
pub struct SlackWebhookNotifier {
    url: String,
    client: Client,
}

impl SlackWebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, NotifyError> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }

    pub fn payload(notification: &Notification) -> serde_json::Value {
        let (color, title) = match notification.status {
            RunStatus::Success => ("good", "succeeded"),
            RunStatus::PartialFailure => ("warning", "partially failed"),
            RunStatus::Failure => ("danger", "failed"),
        };

        json!({
            "attachments": [{
                "color": color,
                "title": format!("{} ingestion {}", notification.pipeline_name, title),
                "text": notification.details,
                "fields": [
                    { "title": "Status", "value": notification.status.as_str(), "short": true },
                    { "title": "Pipeline", "value": notification.pipeline_name, "short": true },
                ],
            }]
        })
    }
}

#[async_trait]
impl Notifier for SlackWebhookNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(&Self::payload(notification))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status(status));
        }
        Ok(())
    }

    fn channel_name(&self) -> &str {
        "slack"
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn notification(status: RunStatus) -> Notification {
        Notification {
            status,
            pipeline_name: "ona".to_string(),
            details: "1 form(s), 3 record(s) upserted, 0 dropped, 0 failed".to_string(),
        }
    }

    #[test]
    fn test_slack_payload_colour() {
        let payload = SlackWebhookNotifier::payload(&notification(RunStatus::PartialFailure));
        let attachment = &payload["attachments"][0];

        assert_eq!(attachment["color"], "warning");
        assert_eq!(attachment["title"], "ona ingestion partially failed");
        assert_eq!(attachment["fields"][0]["value"], "partial_failure");
    }

    #[test]
    fn test_notification_serializes_status() {
        let value = serde_json::to_value(notification(RunStatus::Success)).unwrap();
        assert_eq!(value["status"], "success");
        assert_eq!(value["pipeline_name"], "ona");
    }

    #[tokio::test]
    async fn test_log_notifier_never_fails() {
        for status in [RunStatus::Success, RunStatus::PartialFailure, RunStatus::Failure] {
            assert!(LogNotifier.send(&notification(status)).await.is_ok());
        }
    }
}
