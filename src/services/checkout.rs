//! Checkout orchestration: validate, reserve, authorize, and undo on failure.

use std::sync::Arc;

use metrics::counter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    entities::order::{self, OrderStatus},
    errors::ServiceError,
    events::{Event, EventSender, OrderSnapshot},
    middleware_helpers::retry::{with_retry, RetryConfig, RetryPolicy},
    services::{
        customers::CustomerService,
        inventory_validator::{CartLine, InventoryValidator},
        orders::{AddressInput, CompensationOutcome, NewOrder, OrderService},
        payment_gateway::{AuthorizationRequest, PaymentGateway},
    },
};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ShippingMethod {
    Standard,
    Express,
    Overnight,
}

/// Flat shipping rate per method.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShippingRates {
    pub standard: Decimal,
    pub express: Decimal,
    pub overnight: Decimal,
}

impl ShippingRates {
    pub fn rate_for(&self, method: ShippingMethod) -> Decimal {
        match method {
            ShippingMethod::Standard => self.standard,
            ShippingMethod::Express => self.express,
            ShippingMethod::Overnight => self.overnight,
        }
    }
}

/// Upper bound on any client-supplied amount.
const MAX_CLAIMED_AMOUNT: Decimal = Decimal::from_parts(1_000_000_000, 0, 0, false, 0);

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct CheckoutLineInput {
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    #[validate(range(min = 1, max = 1000))]
    pub quantity: i32,
    /// Price shown to the shopper; the server price is what gets charged
    pub unit_price: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct CheckoutRequest {
    #[validate(length(min = 1, max = 100))]
    pub items: Vec<CheckoutLineInput>,
    #[validate(email)]
    pub email: String,
    pub shipping_address: AddressInput,
    pub billing_address: Option<AddressInput>,
    pub shipping_method: ShippingMethod,
    pub expected_total: Option<Decimal>,
}

impl CheckoutRequest {
    /// Runs field validation on the request and everything nested in it.
    pub fn validate_all(&self) -> Result<(), ServiceError> {
        self.validate()?;
        for (index, item) in self.items.iter().enumerate() {
            item.validate().map_err(|e| {
                ServiceError::ValidationError(format!("line {}: {}", index + 1, e))
            })?;
            if item.unit_price <= Decimal::ZERO || item.unit_price > MAX_CLAIMED_AMOUNT {
                return Err(ServiceError::ValidationError(format!(
                    "line {}: unit_price must be between 0 and {}",
                    index + 1,
                    MAX_CLAIMED_AMOUNT
                )));
            }
        }
        if let Some(total) = self.expected_total {
            if total < Decimal::ZERO || total > MAX_CLAIMED_AMOUNT {
                return Err(ServiceError::ValidationError(format!(
                    "expected_total must be between 0 and {}",
                    MAX_CLAIMED_AMOUNT
                )));
            }
        }
        self.shipping_address
            .validate()
            .map_err(|e| ServiceError::ValidationError(format!("shipping_address: {}", e)))?;
        if let Some(billing) = &self.billing_address {
            billing
                .validate()
                .map_err(|e| ServiceError::ValidationError(format!("billing_address: {}", e)))?;
        }
        Ok(())
    }

    fn cart_lines(&self) -> Vec<CartLine> {
        self.items
            .iter()
            .map(|item| CartLine {
                product_id: item.product_id,
                variant_id: item.variant_id,
                quantity: item.quantity,
                unit_price: item.unit_price,
            })
            .collect()
    }
}

/// Authenticated shopper, inserted as a request extension by the auth layer.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomerSession {
    pub customer_id: Uuid,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CheckoutResult {
    pub order_id: Uuid,
    pub order_number: String,
    pub status: OrderStatus,
    pub total: Decimal,
    pub currency: String,
    /// Client-side handle for confirming the payment with the provider
    pub payment_handle: String,
}

/// Only database hiccups are worth repeating during a rollback.
struct CompensationRetryPolicy;

impl RetryPolicy<ServiceError> for CompensationRetryPolicy {
    fn is_retryable(&self, error: &ServiceError) -> bool {
        matches!(error, ServiceError::DatabaseError(_))
    }
}

#[derive(Clone)]
pub struct CheckoutService {
    orders: OrderService,
    customers: CustomerService,
    validator: InventoryValidator,
    gateway: Arc<dyn PaymentGateway>,
    event_sender: EventSender,
    currency: String,
    shipping_rates: ShippingRates,
    compensation_retry: RetryConfig,
}

impl CheckoutService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        orders: OrderService,
        customers: CustomerService,
        validator: InventoryValidator,
        gateway: Arc<dyn PaymentGateway>,
        event_sender: EventSender,
        currency: String,
        shipping_rates: ShippingRates,
        compensation_retry: RetryConfig,
    ) -> Self {
        Self {
            orders,
            customers,
            validator,
            gateway,
            event_sender,
            currency,
            shipping_rates,
            compensation_retry,
        }
    }

    /// Turns a cart into a PENDING order with a payment authorization.
    #[instrument(skip(self, request, session), fields(lines = request.items.len(), authenticated = session.is_some()))]
    pub async fn checkout(
        &self,
        request: CheckoutRequest,
        session: Option<CustomerSession>,
    ) -> Result<CheckoutResult, ServiceError> {
        let result = self.run_checkout(request, session).await;
        match &result {
            Ok(_) => counter!("storefront.checkout.completed", 1),
            Err(e) => counter!("storefront.checkout.rejected", 1, "reason" => e.code()),
        }
        result
    }

    async fn run_checkout(
        &self,
        request: CheckoutRequest,
        session: Option<CustomerSession>,
    ) -> Result<CheckoutResult, ServiceError> {
        request.validate_all()?;

        let customer_id = match &session {
            Some(session) => session.customer_id,
            None => self.customers.resolve_guest(&request.email).await?.id,
        };

        let shipping = self.shipping_rates.rate_for(request.shipping_method);
        let cart = self
            .validator
            .validate(&request.cart_lines(), shipping, request.expected_total)
            .await?;

        let order = self
            .orders
            .create_pending_order(NewOrder {
                customer_id: Some(customer_id),
                customer_email: request.email.trim().to_lowercase(),
                currency: self.currency.clone(),
                shipping_method: request.shipping_method.to_string(),
                cart,
                shipping_address: request.shipping_address,
                billing_address: request.billing_address,
            })
            .await?;

        let authorization = match self
            .gateway
            .create_authorization(&AuthorizationRequest::for_order(&order))
            .await
        {
            Ok(authorization) => authorization,
            Err(e) => {
                error!(order_id = %order.id, "payment authorization failed: {}", e);
                return Err(self.compensate(&order, None, e.into()).await);
            }
        };

        if let Err(e) = self
            .orders
            .set_payment_reference(order.id, &authorization.reference)
            .await
        {
            error!(order_id = %order.id, "failed to record payment reference: {}", e);
            return Err(self
                .compensate(&order, Some(&authorization.reference), e)
                .await);
        }

        self.event_sender
            .publish(Event::OrderCreated(OrderSnapshot::from(&order)));

        info!(
            order_id = %order.id,
            order_number = %order.order_number,
            reference = %authorization.reference,
            "checkout completed"
        );

        Ok(CheckoutResult {
            order_id: order.id,
            order_number: order.order_number,
            status: order.status,
            total: order.total,
            currency: order.currency,
            payment_handle: authorization
                .client_secret
                .unwrap_or(authorization.reference),
        })
    }

    /// Undoes a committed order after a downstream failure.
    ///
    /// Returns the error to report: `cause` when the rollback succeeded,
    /// `ReconciliationFatal` when it did not.
    async fn compensate(
        &self,
        order: &order::Model,
        authorization: Option<&str>,
        cause: ServiceError,
    ) -> ServiceError {
        if let Some(reference) = authorization {
            if let Err(e) = self.gateway.cancel_authorization(reference).await {
                warn!(order_id = %order.id, %reference, "could not void authorization: {}", e);
            }
        }

        let rollback = with_retry(&self.compensation_retry, CompensationRetryPolicy, || {
            self.orders.compensate_order(order.id)
        })
        .await;

        match rollback {
            Ok(outcome) => {
                let label = match outcome {
                    CompensationOutcome::RolledBack => "rolled_back",
                    CompensationOutcome::AlreadyAbsent => "already_absent",
                };
                counter!("storefront.checkout.compensations", 1, "result" => label);
                cause
            }
            Err(rollback_err) => {
                let reason = format!(
                    "checkout failed ({}) and rollback failed ({})",
                    cause, rollback_err
                );
                error!(
                    order_id = %order.id,
                    order_number = %order.order_number,
                    "FATAL: order left in inconsistent state: {}",
                    reason
                );
                counter!("storefront.checkout.compensations", 1, "result" => "failed");

                if let Err(flag_err) = self.orders.flag_for_reconciliation(order.id, &reason).await {
                    error!(order_id = %order.id, "could not flag order for reconciliation: {}", flag_err);
                }
                self.event_sender.publish(Event::ReconciliationRequired {
                    order_id: order.id,
                    reason: reason.clone(),
                });

                ServiceError::ReconciliationFatal {
                    order_id: order.id,
                    reason,
                }
            }
        }
    }
}
