use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::entities::order::OrderStatus;

fn current_request_id() -> Option<String> {
    crate::tracing::current_request_id().map(|rid| rid.as_str().to_string())
}

/// Error body returned by every failing endpoint
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "error": "Conflict",
    "message": "Insufficient stock for line 1: requested 3, available 2",
    "details": "insufficient_stock",
    "request_id": "req-abc123xyz",
    "timestamp": "2024-12-09T10:30:00.000Z"
}))]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Not Found", "Bad Request")
    pub error: String,
    /// Human-readable error description
    pub message: String,
    /// Machine-readable error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Request identifier for support and debugging
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// RFC 3339 timestamp when the error occurred
    pub timestamp: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] DbErr),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Product {product_id} referenced by line {line} does not exist")]
    ProductNotFound { line: usize, product_id: Uuid },

    #[error("Variant {variant_id} referenced by line {line} does not exist for that product")]
    VariantNotFound { line: usize, variant_id: Uuid },

    #[error("Insufficient stock for line {line}: requested {requested}, available {available}")]
    InsufficientStock {
        line: usize,
        requested: i32,
        available: i32,
    },

    #[error("Order total mismatch: claimed {claimed}, computed {computed}")]
    TotalMismatch {
        claimed: Decimal,
        computed: Decimal,
        line: Option<usize>,
    },

    #[error("Payment gateway error: {0}")]
    Gateway(String),

    #[error("Invalid webhook signature: {0}")]
    InvalidSignature(String),

    #[error("No order matches payment event {event_id}")]
    OrderNotFound { event_id: String },

    #[error("Order {order_id} requires manual reconciliation: {reason}")]
    ReconciliationFatal { order_id: Uuid, reason: String },

    #[error("Order is in terminal status '{status}' and cannot transition")]
    TerminalState { status: OrderStatus },

    #[error("Cannot transition order from '{from}' via {attempted}")]
    InvalidTransition { from: OrderStatus, attempted: String },

    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    #[error("Concurrent modification of order {0}")]
    ConcurrentModification(Uuid),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl ServiceError {
    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ValidationError(_) | Self::BadRequest(_) | Self::InvalidStatus(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::NotFound(_) | Self::ProductNotFound { .. } | Self::VariantNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            Self::InsufficientStock { .. }
            | Self::TerminalState { .. }
            | Self::InvalidTransition { .. }
            | Self::ConcurrentModification(_) => StatusCode::CONFLICT,
            Self::TotalMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Gateway(_) => StatusCode::BAD_GATEWAY,
            Self::InvalidSignature(_) | Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            // The provider redelivers on 5xx, which is what an unresolved order needs.
            Self::OrderNotFound { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::DatabaseError(_) | Self::ReconciliationFatal { .. } | Self::InternalError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable machine-readable code for the error category.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DatabaseError(_) => "database_error",
            Self::ValidationError(_) => "validation_error",
            Self::BadRequest(_) => "bad_request",
            Self::NotFound(_) => "not_found",
            Self::ProductNotFound { .. } => "product_not_found",
            Self::VariantNotFound { .. } => "variant_not_found",
            Self::InsufficientStock { .. } => "insufficient_stock",
            Self::TotalMismatch { .. } => "total_mismatch",
            Self::Gateway(_) => "gateway_error",
            Self::InvalidSignature(_) => "invalid_signature",
            Self::OrderNotFound { .. } => "order_not_found",
            Self::ReconciliationFatal { .. } => "reconciliation_required",
            Self::TerminalState { .. } => "terminal_state",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::InvalidStatus(_) => "invalid_status",
            Self::ConcurrentModification(_) => "concurrent_modification",
            Self::Unauthorized(_) => "unauthorized",
            Self::InternalError(_) => "internal_error",
        }
    }

    /// Whether the caller may retry the same request and expect a different result.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DatabaseError(_)
                | Self::Gateway(_)
                | Self::OrderNotFound { .. }
                | Self::ConcurrentModification(_)
        )
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::InternalError(_) => "Internal server error".to_string(),
            Self::ReconciliationFatal { order_id, .. } => format!(
                "Order {} could not be rolled back and has been flagged for review",
                order_id
            ),
            Self::InvalidSignature(_) => "Invalid webhook signature".to_string(),
            _ => self.to_string(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_message = self.response_message();

        let request_id = current_request_id();
        let err = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message: error_message,
            details: Some(self.code().to_string()),
            request_id,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(err)).into_response()
    }
}
