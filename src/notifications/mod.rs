//! Outbound order notifications.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::entities::order::OrderStatus;
use crate::events::Event;
use crate::services::payment_gateway::webhook::sign_payload;

pub const NOTIFICATION_SIGNATURE_HEADER: &str = "x-storefront-signature";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NotificationKind {
    OrderConfirmation,
    PaymentReceived,
    OrderCancelled,
    StatusUpdate,
    ReconciliationAlert,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderNotification {
    pub id: Uuid,
    pub kind: NotificationKind,
    pub order_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<OrderStatus>,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl OrderNotification {
    pub fn from_event(event: &Event) -> Self {
        let (kind, order, message) = match event {
            Event::OrderCreated(order) => (
                NotificationKind::OrderConfirmation,
                Some(order),
                format!("Order {} received", order.order_number),
            ),
            Event::OrderPaid(order) => (
                NotificationKind::PaymentReceived,
                Some(order),
                format!("Payment received for order {}", order.order_number),
            ),
            Event::OrderCancelled(order) => (
                NotificationKind::OrderCancelled,
                Some(order),
                format!("Order {} was cancelled", order.order_number),
            ),
            Event::OrderStatusChanged { order, from, to } => (
                NotificationKind::StatusUpdate,
                Some(order),
                format!("Order {} moved from {} to {}", order.order_number, from, to),
            ),
            Event::ReconciliationRequired { reason, .. } => (
                NotificationKind::ReconciliationAlert,
                None,
                reason.clone(),
            ),
        };

        let order_id = match event {
            Event::ReconciliationRequired { order_id, .. } => *order_id,
            _ => order.map(|o| o.order_id).unwrap_or_default(),
        };

        Self {
            id: Uuid::new_v4(),
            kind,
            order_id,
            order_number: order.map(|o| o.order_number.clone()),
            customer_email: order.map(|o| o.customer_email.clone()),
            status: order.map(|o| o.status),
            message,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Receiver rejected notification with status {0}")]
    Rejected(u16),
}

/// Delivery channel for order notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &OrderNotification) -> Result<(), NotificationError>;
}

/// Writes notifications to the log only.
#[derive(Debug, Default, Clone)]
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn notify(&self, notification: &OrderNotification) -> Result<(), NotificationError> {
        info!(
            kind = %notification.kind,
            order_id = %notification.order_id,
            "{}",
            notification.message
        );
        Ok(())
    }
}

/// POSTs notifications as JSON, signed when a secret is configured.
#[derive(Clone)]
pub struct HttpNotifier {
    client: reqwest::Client,
    url: String,
    secret: Option<String>,
}

impl HttpNotifier {
    pub fn new(
        url: impl Into<String>,
        secret: Option<String>,
        timeout: Duration,
    ) -> Result<Self, NotificationError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            secret: secret.filter(|s| !s.is_empty()),
        })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    #[instrument(skip(self, notification), fields(kind = %notification.kind, order_id = %notification.order_id))]
    async fn notify(&self, notification: &OrderNotification) -> Result<(), NotificationError> {
        let body = serde_json::to_string(notification)?;
        let mut request = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json");

        if let Some(secret) = &self.secret {
            let timestamp = Utc::now().timestamp();
            let signature = sign_payload(secret, timestamp, body.as_bytes());
            request = request.header(
                NOTIFICATION_SIGNATURE_HEADER,
                format!("t={},v1={}", timestamp, signature),
            );
        }

        let response = request.body(body).send().await?;
        if !response.status().is_success() {
            return Err(NotificationError::Rejected(response.status().as_u16()));
        }
        Ok(())
    }
}
