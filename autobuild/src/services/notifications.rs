//! Owner notifications for lifecycle side effects.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

use crate::constants::defaults::HTTP_TIMEOUT;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationTemplate {
    WorkspaceDormant,
    WorkspaceAutoUpdated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub timestamp: DateTime<Utc>,
    pub template: NotificationTemplate,
    pub user_id: Uuid,
    pub labels: HashMap<String, String>,
    /// Component that raised it
    pub source: String,
    /// Entities the notification is about
    pub targets: Vec<Uuid>,
}

#[async_trait]
pub trait NotificationsEnqueuer: Send + Sync {
    async fn enqueue(&self, notification: &Notification) -> Result<()>;
}

/// Delivers notifications to a webhook as JSON.
#[derive(Clone)]
pub struct WebhookNotifier {
    webhook_url: String,
    client: Client,
}

impl WebhookNotifier {
    pub fn new(webhook_url: String) -> Result<Self> {
        let client = Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            webhook_url,
            client,
        })
    }
}

#[async_trait]
impl NotificationsEnqueuer for WebhookNotifier {
    async fn enqueue(&self, notification: &Notification) -> Result<()> {
        if self.webhook_url.is_empty() {
            debug!("No webhook URL configured, skipping {:?}", notification.template);
            return Ok(());
        }

        let response = self
            .client
            .post(&self.webhook_url)
            .json(notification)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "notification webhook returned status {} for {:?}",
                response.status(),
                notification.template
            ));
        }

        info!(
            "Notification {:?} sent for user {}",
            notification.template, notification.user_id
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl NotificationsEnqueuer for NoopNotifier {
    async fn enqueue(&self, _notification: &Notification) -> Result<()> {
        Ok(())
    }
}
