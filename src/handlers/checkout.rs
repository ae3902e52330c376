use axum::{extract::rejection::JsonRejection, extract::State, response::IntoResponse, Extension, Json};

use super::common::{created_response, json_body};
use crate::{
    errors::ServiceError,
    services::checkout::{CheckoutRequest, CheckoutResult, CustomerSession},
    AppState,
};

/// Place an order from a cart
#[utoipa::path(
    post,
    path = "/api/v1/checkout",
    summary = "Checkout",
    description = "Validate the cart against live stock and prices, reserve stock, create a pending order and request a payment authorization",
    request_body = CheckoutRequest,
    responses(
        (status = 201, description = "Order created", body = CheckoutResult,
            headers(("X-Request-Id" = String, description = "Unique request id"))
        ),
        (status = 400, description = "Invalid request", body = crate::errors::ErrorResponse),
        (status = 404, description = "Unknown product or variant", body = crate::errors::ErrorResponse),
        (status = 409, description = "Insufficient stock", body = crate::errors::ErrorResponse),
        (status = 422, description = "Total does not match server pricing", body = crate::errors::ErrorResponse),
        (status = 502, description = "Payment provider failure", body = crate::errors::ErrorResponse),
    ),
    tag = "Checkout"
)]
pub async fn create_checkout(
    State(state): State<AppState>,
    session: Option<Extension<CustomerSession>>,
    payload: Result<Json<CheckoutRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ServiceError> {
    let request = json_body(payload)?;
    let result = state
        .services
        .checkout
        .checkout(request, session.map(|Extension(session)| session))
        .await?;

    Ok(created_response(result))
}
