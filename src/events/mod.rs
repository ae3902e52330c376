use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::entities::order::{self, OrderStatus};
use crate::notifications::{Notifier, OrderNotification};

/// Order fields carried with every order event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub order_id: Uuid,
    pub order_number: String,
    pub status: OrderStatus,
    pub total: Decimal,
    pub currency: String,
    pub customer_email: String,
}

impl From<&order::Model> for OrderSnapshot {
    fn from(order: &order::Model) -> Self {
        Self {
            order_id: order.id,
            order_number: order.order_number.clone(),
            status: order.status,
            total: order.total,
            currency: order.currency.clone(),
            customer_email: order.customer_email.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    OrderCreated(OrderSnapshot),
    OrderPaid(OrderSnapshot),
    OrderCancelled(OrderSnapshot),
    OrderStatusChanged {
        order: OrderSnapshot,
        from: OrderStatus,
        to: OrderStatus,
    },
    ReconciliationRequired {
        order_id: Uuid,
        reason: String,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::OrderCreated(_) => "order_created",
            Event::OrderPaid(_) => "order_paid",
            Event::OrderCancelled(_) => "order_cancelled",
            Event::OrderStatusChanged { .. } => "order_status_changed",
            Event::ReconciliationRequired { .. } => "reconciliation_required",
        }
    }
}

/// Handle for publishing events to the background processor.
#[derive(Clone, Debug)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Enqueues an event without waiting; a full or closed channel drops it.
    pub fn publish(&self, event: Event) {
        let name = event.name();
        match self.sender.try_send(event) {
            Ok(()) => debug!(event = name, "event published"),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(event = name, "event channel full, dropping event");
                metrics::counter!("storefront.events.dropped", 1, "reason" => "full");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(event = name, "event channel closed, dropping event");
                metrics::counter!("storefront.events.dropped", 1, "reason" => "closed");
            }
        }
    }
}

/// Drains the event channel, handing each event to `notifier`.
///
/// Delivery failures are logged and never propagate back to the request that
/// produced the event.
pub async fn process_events(mut rx: mpsc::Receiver<Event>, notifier: Arc<dyn Notifier>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        debug!(event = event.name(), "Received event");
        let notification = OrderNotification::from_event(&event);

        if let Err(e) = notifier.notify(&notification).await {
            error!(
                event = event.name(),
                order_id = %notification.order_id,
                "Failed to deliver notification: {}",
                e
            );
            metrics::counter!("storefront.notifications.failed", 1);
        } else {
            metrics::counter!("storefront.notifications.sent", 1, "kind" => notification.kind.to_string());
        }
    }

    info!("Event channel closed, stopping event processing");
}
