//! Delivery backends for routed notifications.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use super::{NotificationEvent, NotifyError};

/// Delivers one event to one channel.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, channel: &str, event: &NotificationEvent) -> Result<(), NotifyError>;
}

/// Default sink: webhook channels get a JSON POST, named channels are logged.
pub struct ChannelSink {
    http_client: Client,
}

impl ChannelSink {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(10))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            http_client: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    pub fn is_webhook(channel: &str) -> bool {
        channel.starts_with("http://") || channel.starts_with("https://")
    }
}

impl Default for ChannelSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationSink for ChannelSink {
    async fn deliver(&self, channel: &str, event: &NotificationEvent) -> Result<(), NotifyError> {
        if !Self::is_webhook(channel) {
            tracing::info!(
                target: "fleet_forge::notify",
                channel = channel,
                category = %event.category,
                key = %event.key,
                title = %event.title,
                "{}",
                event.body
            );
            return Ok(());
        }

        let response = self
            .http_client
            .post(channel)
            .header("Content-Type", "application/json")
            .json(event)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected {
                channel: channel.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}
