pub mod admin_orders;
pub mod checkout;
pub mod common;
pub mod payment_webhooks;

use std::sync::Arc;

use crate::{
    config::AppConfig,
    db::DbPool,
    events::EventSender,
    services::{
        checkout::CheckoutService,
        customers::CustomerService,
        inventory_validator::InventoryValidator,
        orders::OrderService,
        payment_gateway::{PaymentGateway, WebhookVerifier},
        webhook_reconciler::WebhookReconciler,
    },
};

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub orders: OrderService,
    pub customers: CustomerService,
    pub checkout: CheckoutService,
    pub webhooks: WebhookReconciler,
}

impl AppServices {
    pub fn new(
        db_pool: Arc<DbPool>,
        config: &AppConfig,
        event_sender: EventSender,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        let orders = OrderService::new(db_pool.clone(), event_sender.clone());
        let customers = CustomerService::new(db_pool.clone());
        let validator = InventoryValidator::new(Arc::new(orders.clone()));

        let checkout = CheckoutService::new(
            orders.clone(),
            customers.clone(),
            validator,
            gateway,
            event_sender.clone(),
            config.default_currency.to_uppercase(),
            config.shipping_rates(),
            config.compensation_retry(),
        );

        let webhooks = WebhookReconciler::new(
            db_pool,
            orders.clone(),
            WebhookVerifier::new(
                config.payment_webhook_secret.clone(),
                config.payment_webhook_tolerance(),
            ),
            event_sender,
            config.order_lookup_retry(),
        );

        Self {
            orders,
            customers,
            checkout,
            webhooks,
        }
    }
}
