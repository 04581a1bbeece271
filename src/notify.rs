//! Outbound notifications.
//!
//! Jobs and workflows report noteworthy things through a [`Notifier`]. The
//! webhook implementation posts chat-webhook style JSON (`content` carries
//! the human readable line, `event` the structured payload).

use crate::state::{ChannelId, UserId};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;

/// Something worth telling the outside world about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    /// A channel timer ran out.
    TimerExpired {
        channel_id: ChannelId,
        owner_id: UserId,
        label: String,
    },
    /// A value in the external feed changed between two refreshes.
    FeedChanged {
        key: String,
        previous: i64,
        current: i64,
    },
    /// An externally triggered submission arrived.
    SubmissionReceived { user_id: UserId, submission_id: i64 },
}

impl std::fmt::Display for Notification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TimerExpired {
                channel_id,
                owner_id,
                label,
            } => {
                if label.is_empty() {
                    write!(f, "timer in channel {channel_id} for user {owner_id} expired")
                } else {
                    write!(
                        f,
                        "timer \"{label}\" in channel {channel_id} for user {owner_id} expired"
                    )
                }
            }
            Self::FeedChanged {
                key,
                previous,
                current,
            } => write!(f, "{key} changed from {previous} to {current}"),
            Self::SubmissionReceived {
                user_id,
                submission_id,
            } => write!(f, "submission {submission_id} received from user {user_id}"),
        }
    }
}

/// Notification sink contract.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// Writes notifications to the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
        tracing::info!(%notification, "notification");
        Ok(())
    }
}

/// Posts notifications to an HTTP webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
        let body = json!({
            "content": notification.to_string(),
            "event": notification,
        });
        let response = self.client.post(&self.url).json(&body).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("webhook notification failed ({status}): {body}");
        }
        Ok(())
    }
}
