//! Applies payment provider events to orders exactly once.

use std::sync::Arc;

use metrics::counter;
use sea_orm::{DatabaseConnection, DatabaseTransaction, EntityTrait, TransactionTrait};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};
use utoipa::ToSchema;

use crate::{
    entities::{
        order::{self, OrderStatus},
        order_address::AddressKind,
        processed_webhook_event::LedgerOutcome,
    },
    errors::ServiceError,
    events::{Event, EventSender, OrderSnapshot},
    middleware_helpers::retry::{with_retry, RetryConfig, RetryPolicy},
    services::{
        idempotency_ledger::{IdempotencyLedger, LedgerEntry, RecordOutcome},
        order_status::{transition_for_event, PaymentEventKind, Transition},
        orders::{flag_order, guarded_update, upsert_address, OrderService},
        payment_gateway::{PaymentEvent, WebhookVerifier},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// Status changed
    Applied,
    /// Accepted; status already where the event puts it
    Unchanged,
    /// Acknowledged without effect
    Ignored,
    /// Duplicate delivery
    AlreadyProcessed,
}

impl WebhookOutcome {
    pub fn label(self) -> &'static str {
        match self {
            WebhookOutcome::Applied => "applied",
            WebhookOutcome::Unchanged => "unchanged",
            WebhookOutcome::Ignored => "ignored",
            WebhookOutcome::AlreadyProcessed => "already_processed",
        }
    }

    fn ledger_outcome(self) -> LedgerOutcome {
        match self {
            WebhookOutcome::Ignored => LedgerOutcome::Ignored,
            _ => LedgerOutcome::Applied,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ResolutionStrategy {
    MetadataOrderId,
    PaymentReference,
    MetadataOrderNumber,
}

impl ResolutionStrategy {
    const ORDERED: [ResolutionStrategy; 3] = [
        ResolutionStrategy::MetadataOrderId,
        ResolutionStrategy::PaymentReference,
        ResolutionStrategy::MetadataOrderNumber,
    ];

    fn label(self) -> &'static str {
        match self {
            ResolutionStrategy::MetadataOrderId => "metadata_order_id",
            ResolutionStrategy::PaymentReference => "payment_reference",
            ResolutionStrategy::MetadataOrderNumber => "metadata_order_number",
        }
    }
}

struct OrderResolutionPolicy;

impl RetryPolicy<ServiceError> for OrderResolutionPolicy {
    fn is_retryable(&self, error: &ServiceError) -> bool {
        matches!(error, ServiceError::OrderNotFound { .. })
    }
}

struct Applied {
    outcome: WebhookOutcome,
    notify: Option<Event>,
}

#[derive(Clone)]
pub struct WebhookReconciler {
    db: Arc<DatabaseConnection>,
    orders: OrderService,
    ledger: IdempotencyLedger,
    verifier: WebhookVerifier,
    event_sender: EventSender,
    lookup_retry: RetryConfig,
}

impl WebhookReconciler {
    pub fn new(
        db: Arc<DatabaseConnection>,
        orders: OrderService,
        verifier: WebhookVerifier,
        event_sender: EventSender,
        lookup_retry: RetryConfig,
    ) -> Self {
        Self {
            ledger: IdempotencyLedger::new(db.clone()),
            db,
            orders,
            verifier,
            event_sender,
            lookup_retry,
        }
    }

    /// Verifies, deduplicates and applies one provider delivery.
    #[instrument(skip(self, payload, signature), fields(bytes = payload.len()))]
    pub async fn handle(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> Result<WebhookOutcome, ServiceError> {
        if let Err(e) = self.verifier.verify(payload, signature) {
            warn!("Payment webhook signature verification failed: {}", e);
            counter!("storefront.webhook.rejected", 1, "reason" => "signature");
            return Err(e);
        }

        let event = PaymentEvent::parse(payload)?;
        let outcome = self.process(&event).await?;

        info!(
            event_id = %event.id,
            event_type = %event.event_type,
            outcome = outcome.label(),
            "payment webhook processed"
        );
        counter!("storefront.webhook.events", 1, "outcome" => outcome.label());
        Ok(outcome)
    }

    async fn process(&self, event: &PaymentEvent) -> Result<WebhookOutcome, ServiceError> {
        if self.ledger.find(&event.id).await?.is_some() {
            debug!(event_id = %event.id, "duplicate delivery");
            return Ok(WebhookOutcome::AlreadyProcessed);
        }

        let Some(kind) = PaymentEventKind::from_event_type(&event.event_type) else {
            info!(event_type = %event.event_type, "Unhandled payment webhook type");
            let recorded = IdempotencyLedger::record(
                &*self.db,
                LedgerEntry {
                    event_id: event.id.clone(),
                    event_type: event.event_type.clone(),
                    order_id: None,
                    outcome: LedgerOutcome::Ignored,
                },
            )
            .await?;
            return Ok(match recorded {
                RecordOutcome::Inserted => WebhookOutcome::Ignored,
                RecordOutcome::AlreadyRecorded => WebhookOutcome::AlreadyProcessed,
            });
        };

        let order = with_retry(&self.lookup_retry, OrderResolutionPolicy, || {
            self.resolve_order(event)
        })
        .await?;

        match self.apply_in_transaction(event, kind, order.id).await {
            Err(ServiceError::ConcurrentModification(order_id)) => {
                // Another delivery of this event may have won the row
                if self.ledger.find(&event.id).await?.is_some() {
                    debug!(event_id = %event.id, %order_id, "duplicate delivery committed first");
                    return Ok(WebhookOutcome::AlreadyProcessed);
                }
                warn!(event_id = %event.id, %order_id, "order changed while applying event, retrying once");
                self.apply_in_transaction(event, kind, order_id).await
            }
            other => other,
        }
    }

    async fn apply_in_transaction(
        &self,
        event: &PaymentEvent,
        kind: PaymentEventKind,
        order_id: uuid::Uuid,
    ) -> Result<WebhookOutcome, ServiceError> {
        let txn = self.db.begin().await?;
        match self.apply(&txn, event, kind, order_id).await {
            Ok(applied) if applied.outcome == WebhookOutcome::AlreadyProcessed => {
                txn.rollback().await?;
                Ok(WebhookOutcome::AlreadyProcessed)
            }
            Ok(applied) => {
                txn.commit().await?;
                if let Some(notification) = applied.notify {
                    self.event_sender.publish(notification);
                }
                Ok(applied.outcome)
            }
            Err(e) => {
                if let Err(rollback_err) = txn.rollback().await {
                    error!("Failed to roll back webhook application: {}", rollback_err);
                }
                Err(e)
            }
        }
    }

    /// Finds the order an event refers to, trying each strategy in turn.
    async fn resolve_order(&self, event: &PaymentEvent) -> Result<order::Model, ServiceError> {
        for strategy in ResolutionStrategy::ORDERED {
            let found = match strategy {
                ResolutionStrategy::MetadataOrderId => match event.metadata_order_id() {
                    Some(id) => self.orders.find_order(id).await?,
                    None => continue,
                },
                ResolutionStrategy::PaymentReference => {
                    self.orders
                        .find_by_payment_reference(event.authorization_reference())
                        .await?
                }
                ResolutionStrategy::MetadataOrderNumber => match event.metadata_order_number() {
                    Some(number) => self.orders.find_by_order_number(number).await?,
                    None => continue,
                },
            };

            match found {
                Some(order) => {
                    debug!(event_id = %event.id, strategy = strategy.label(), order_id = %order.id, "order resolved");
                    counter!("storefront.webhook.order_resolution", 1, "strategy" => strategy.label(), "result" => "hit");
                    return Ok(order);
                }
                None => {
                    debug!(event_id = %event.id, strategy = strategy.label(), "order resolution miss");
                    counter!("storefront.webhook.order_resolution", 1, "strategy" => strategy.label(), "result" => "miss");
                }
            }
        }

        warn!(event_id = %event.id, reference = %event.authorization_reference(), "no order matches payment event");
        Err(ServiceError::OrderNotFound {
            event_id: event.id.clone(),
        })
    }

    async fn apply(
        &self,
        txn: &DatabaseTransaction,
        event: &PaymentEvent,
        kind: PaymentEventKind,
        order_id: uuid::Uuid,
    ) -> Result<Applied, ServiceError> {
        // The order may have been rolled back since it was resolved
        let order = order::Entity::find_by_id(order_id)
            .one(txn)
            .await?
            .ok_or_else(|| ServiceError::OrderNotFound {
                event_id: event.id.clone(),
            })?;

        let reference = event.authorization_reference();
        if let Some(known) = order.payment_reference.as_deref() {
            if known != reference {
                warn!(order_id = %order.id, known, received = reference, "event references a different authorization");
            }
        }

        let (outcome, current, transition) = match transition_for_event(order.status, kind) {
            Ok(transition) => {
                let record_reference = order.payment_reference.is_none();
                let current = if transition.changes_status() || record_reference {
                    guarded_update(
                        txn,
                        &order,
                        transition.to,
                        record_reference.then_some(reference),
                    )
                    .await?
                } else {
                    order
                };
                let outcome = if transition.changes_status() {
                    WebhookOutcome::Applied
                } else {
                    WebhookOutcome::Unchanged
                };
                (outcome, current, Some(transition))
            }
            Err(rejected @ (ServiceError::TerminalState { .. } | ServiceError::InvalidTransition { .. })) => {
                warn!(order_id = %order.id, event_id = %event.id, "event not applicable: {}", rejected);
                if kind.is_success() && order.status == OrderStatus::Cancelled {
                    error!(order_id = %order.id, event_id = %event.id, "payment succeeded for a cancelled order");
                    flag_order(
                        txn,
                        order.id,
                        &format!("{} received for cancelled order", event.event_type),
                    )
                    .await?;
                }
                (WebhookOutcome::Ignored, order, None)
            }
            Err(e) => return Err(e),
        };

        if outcome != WebhookOutcome::Ignored {
            if let Some(address) = event.shipping_address() {
                upsert_address(txn, current.id, AddressKind::Shipping, &address).await?;
            }
        }

        let recorded = IdempotencyLedger::record(
            txn,
            LedgerEntry {
                event_id: event.id.clone(),
                event_type: event.event_type.clone(),
                order_id: Some(current.id),
                outcome: outcome.ledger_outcome(),
            },
        )
        .await?;

        if recorded == RecordOutcome::AlreadyRecorded {
            return Ok(Applied {
                outcome: WebhookOutcome::AlreadyProcessed,
                notify: None,
            });
        }

        Ok(Applied {
            outcome,
            notify: transition
                .filter(Transition::changes_status)
                .map(|t| notification_for(&current, t)),
        })
    }
}

fn notification_for(order: &order::Model, transition: Transition) -> Event {
    let snapshot = OrderSnapshot::from(order);
    match transition.to {
        OrderStatus::Paid => Event::OrderPaid(snapshot),
        OrderStatus::Cancelled => Event::OrderCancelled(snapshot),
        to => Event::OrderStatusChanged {
            order: snapshot,
            from: transition.from,
            to,
        },
    }
}
