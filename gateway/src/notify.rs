use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::{info, warn};

use crate::actor::Feature;

/// Emitted when a rate-limit bucket crosses an alert threshold.
#[derive(Debug, Clone)]
pub struct UsageNotification {
    pub actor_id: String,
    pub feature: Feature,
    pub usage_percentage: u8,
    pub limit: u64,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_usage(&self, notification: &UsageNotification) -> Result<()>;
}

/// Posts `{"text": ...}` to a Slack-style incoming webhook.
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(client: Client, url: String) -> Self {
        Self { client, url }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify_usage(&self, notification: &UsageNotification) -> Result<()> {
        if self.url.trim().is_empty() {
            return Ok(());
        }
        let text = format!(
            "Actor {} reached {}% of its {} limit ({} per interval)",
            notification.actor_id,
            notification.usage_percentage,
            notification.feature,
            notification.limit,
        );
        let response = self.client.post(&self.url).json(&json!({ "text": text })).send().await?;
        if !response.status().is_success() {
            warn!(status = ?response.status(), "Usage webhook returned failure status");
            return Err(anyhow!("usage webhook returned status {}", response.status()));
        }
        info!(
            actor_id = %notification.actor_id,
            feature = %notification.feature,
            pct = notification.usage_percentage,
            "Posted usage threshold notification"
        );
        Ok(())
    }
}

/// Used when no webhook is configured.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify_usage(&self, _notification: &UsageNotification) -> Result<()> {
        Ok(())
    }
}
