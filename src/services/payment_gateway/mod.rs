//! Payment provider integration.
//!
//! [`PaymentGateway`] is the outbound seam used by checkout; [`webhook`]
//! covers the inbound side (signature verification and event parsing).

pub mod http;
pub mod webhook;

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::entities::order;
use crate::errors::ServiceError;
use crate::middleware_helpers::retry::RetryPolicy;

pub use http::HttpPaymentGateway;
pub use webhook::{PaymentEvent, WebhookVerifier};

/// Number of decimal places in the currency's minor unit (ISO 4217).
pub fn currency_exponent(currency: &str) -> u32 {
    match currency.to_ascii_uppercase().as_str() {
        "BIF" | "CLP" | "DJF" | "GNF" | "ISK" | "JPY" | "KMF" | "KRW" | "PYG" | "RWF" | "UGX"
        | "VND" | "VUV" | "XAF" | "XOF" | "XPF" => 0,
        "BHD" | "IQD" | "JOD" | "KWD" | "LYD" | "OMR" | "TND" => 3,
        _ => 2,
    }
}

/// Idempotency key sent with every authorization attempt for an order.
pub fn authorization_idempotency_key(order_id: Uuid) -> String {
    format!("order_{}_authorization", order_id)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthorizationRequest {
    pub order_id: Uuid,
    pub order_number: String,
    pub amount: Decimal,
    pub currency: String,
    pub customer_email: String,
    pub idempotency_key: String,
}

impl AuthorizationRequest {
    pub fn for_order(order: &order::Model) -> Self {
        Self {
            order_id: order.id,
            order_number: order.order_number.clone(),
            amount: order.total,
            currency: order.currency.clone(),
            customer_email: order.customer_email.clone(),
            idempotency_key: authorization_idempotency_key(order.id),
        }
    }

    /// Amount in the currency's minor unit (cents for USD, yen for JPY).
    pub fn amount_minor_units(&self) -> Result<i64, GatewayError> {
        let exponent = currency_exponent(&self.currency);
        let minor = self
            .amount
            .checked_mul(Decimal::from(10_i64.pow(exponent)))
            .ok_or_else(|| {
                GatewayError::InvalidRequest(format!("amount {} out of range", self.amount))
            })?;
        if minor.fract() != Decimal::ZERO {
            return Err(GatewayError::InvalidRequest(format!(
                "amount {} is more precise than {} allows",
                self.amount, self.currency
            )));
        }
        minor
            .to_i64()
            .filter(|v| *v > 0)
            .ok_or_else(|| GatewayError::InvalidRequest(format!("amount {} out of range", self.amount)))
    }
}

/// Provider handle for an authorization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentAuthorization {
    /// Provider authorization id, stored as the order's payment reference
    pub reference: String,
    /// Opaque handle the storefront client uses to confirm payment
    pub client_secret: Option<String>,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("payment provider timed out")]
    Timeout,
    #[error("payment provider returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
    #[error("invalid authorization request: {0}")]
    InvalidRequest(String),
}

impl GatewayError {
    /// Connection failures, timeouts, 5xx and 429 are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Transport(_) | GatewayError::Timeout => true,
            GatewayError::Status { status, .. } => *status == 429 || *status >= 500,
            GatewayError::InvalidResponse(_) | GatewayError::InvalidRequest(_) => false,
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::Timeout
        } else if err.is_decode() {
            GatewayError::InvalidResponse(err.to_string())
        } else {
            GatewayError::Transport(err.to_string())
        }
    }
}

impl From<GatewayError> for ServiceError {
    fn from(err: GatewayError) -> Self {
        ServiceError::Gateway(err.to_string())
    }
}

pub struct GatewayRetryPolicy;

impl RetryPolicy<GatewayError> for GatewayRetryPolicy {
    fn is_retryable(&self, error: &GatewayError) -> bool {
        error.is_retryable()
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Requests an authorization for the order total.
    async fn create_authorization(
        &self,
        request: &AuthorizationRequest,
    ) -> Result<PaymentAuthorization, GatewayError>;

    /// Voids an authorization that will never be captured.
    async fn cancel_authorization(&self, reference: &str) -> Result<(), GatewayError>;
}
