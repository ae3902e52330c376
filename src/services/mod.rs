// Checkout path
pub mod checkout;
pub mod customers;
pub mod inventory_validator;
pub mod orders;

// Order lifecycle
pub mod order_status;

// Payment provider integration
pub mod idempotency_ledger;
pub mod payment_gateway;
pub mod webhook_reconciler;
