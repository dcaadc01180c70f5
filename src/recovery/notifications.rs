//! Incident notifications over multiple delivery channels
//!
//! This module provides:
//! - Webhook delivery posting a JSON envelope
//! - Pluggable email/SMS/Slack/Teams/PagerDuty deliveries
//! - A per-event log of every message sent

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Notification errors
#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),
}

/// Result type for notification operations
pub type NotificationResult<T> = Result<T, NotificationError>;

/// Notification delivery channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationChannel {
    Webhook,
    Email,
    Sms,
    Slack,
    Teams,
    PagerDuty,
}

/// The JSON envelope posted for a disaster event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentNotification {
    pub event_id: String,
    pub kind: String,
    pub severity: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub worker_id: String,
}

/// One delivered message, kept in the per-event log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub channel: NotificationChannel,
    pub message: String,
    pub sent_at: DateTime<Utc>,
    pub delivered: bool,
}

/// Notification delivery trait
#[async_trait]
pub trait NotificationDelivery: Send + Sync {
    async fn deliver(&self, notification: &IncidentNotification) -> NotificationResult<()>;

    fn channel(&self) -> NotificationChannel;
}

/// Webhook delivery posting the JSON envelope to each configured URL.
pub struct WebhookDelivery {
    client: Client,
    urls: Vec<String>,
}

impl WebhookDelivery {
    pub fn new(urls: Vec<String>) -> Self {
        Self {
            client: Client::new(),
            urls,
        }
    }
}

#[async_trait]
impl NotificationDelivery for WebhookDelivery {
    async fn deliver(&self, notification: &IncidentNotification) -> NotificationResult<()> {
        for url in &self.urls {
            let response = self.client.post(url).json(notification).send().await?;
            if !response.status().is_success() {
                return Err(NotificationError::DeliveryFailed(format!(
                    "webhook {} returned {}",
                    url,
                    response.status()
                )));
            }
        }
        Ok(())
    }

    fn channel(&self) -> NotificationChannel {
        NotificationChannel::Webhook
    }
}

/// Log-only delivery standing in for channels whose transport lives
/// outside this core (email/SMS gateways, chat apps, paging).
pub struct LogDelivery {
    channel: NotificationChannel,
}

impl LogDelivery {
    pub fn new(channel: NotificationChannel) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl NotificationDelivery for LogDelivery {
    async fn deliver(&self, notification: &IncidentNotification) -> NotificationResult<()> {
        log::warn!(
            "[{:?}] {} ({}/{}): {}",
            self.channel,
            notification.event_id,
            notification.kind,
            notification.severity,
            notification.message
        );
        Ok(())
    }

    fn channel(&self) -> NotificationChannel {
        self.channel
    }
}

/// Fans one incident message out to every configured channel and keeps
/// a per-event log of what was sent.
pub struct NotificationManager {
    deliveries: Vec<Box<dyn NotificationDelivery>>,
    /// event_id -> messages sent for it
    event_log: RwLock<HashMap<String, Vec<NotificationRecord>>>,
    worker_id: String,
}

impl NotificationManager {
    pub fn new(worker_id: &str) -> Self {
        Self {
            deliveries: Vec::new(),
            event_log: RwLock::new(HashMap::new()),
            worker_id: worker_id.to_string(),
        }
    }

    pub fn add_delivery(&mut self, delivery: Box<dyn NotificationDelivery>) {
        self.deliveries.push(delivery);
    }

    /// Notify every channel about an event. Failures on one channel do
    /// not stop the others; each attempt lands in the event log.
    pub async fn notify(
        &self,
        event_id: &str,
        kind: &str,
        severity: &str,
        message: &str,
    ) -> Vec<NotificationRecord> {
        let notification = IncidentNotification {
            event_id: event_id.to_string(),
            kind: kind.to_string(),
            severity: severity.to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
            worker_id: self.worker_id.clone(),
        };

        let mut records = Vec::new();
        for delivery in &self.deliveries {
            let delivered = match delivery.deliver(&notification).await {
                Ok(()) => true,
                Err(e) => {
                    log::error!(
                        "Notification delivery failed on {:?}: {}",
                        delivery.channel(),
                        e
                    );
                    false
                }
            };
            records.push(NotificationRecord {
                channel: delivery.channel(),
                message: message.to_string(),
                sent_at: Utc::now(),
                delivered,
            });
        }

        self.event_log
            .write()
            .await
            .entry(event_id.to_string())
            .or_default()
            .extend(records.clone());
        records
    }

    /// Every message sent for one event.
    pub async fn log_for(&self, event_id: &str) -> Vec<NotificationRecord> {
        self.event_log
            .read()
            .await
            .get(event_id)
            .cloned()
            .unwrap_or_default()
    }
}
