use axum::{
    extract::{rejection::JsonRejection, Path, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use tracing::info;
use utoipa::ToSchema;

use super::common::{json_body, parse_uuid, success_response};
use crate::{entities::order::OrderStatus, errors::ServiceError, ApiResponse, AppState};

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateOrderStatusRequest {
    /// Target status, e.g. "processing" or "cancelled"
    pub status: String,
}

#[utoipa::path(
    get,
    path = "/api/v1/admin/orders/{id}",
    summary = "Get order",
    params(("id" = String, Path, description = "Order id")),
    responses(
        (status = 200, description = "Order with items and addresses"),
        (status = 401, description = "Missing or invalid admin token", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Admin"
)]
pub async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let order_id = parse_uuid(&id)?;
    let details = state.services.orders.get_order_details(order_id).await?;
    Ok(success_response(ApiResponse::success(details)))
}

#[utoipa::path(
    put,
    path = "/api/v1/admin/orders/{id}/status",
    summary = "Change order status",
    params(("id" = String, Path, description = "Order id")),
    request_body = UpdateOrderStatusRequest,
    responses(
        (status = 200, description = "Status changed"),
        (status = 400, description = "Unknown status", body = crate::errors::ErrorResponse),
        (status = 401, description = "Missing or invalid admin token", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Transition not allowed", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Admin"
)]
pub async fn update_order_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<UpdateOrderStatusRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ServiceError> {
    let order_id = parse_uuid(&id)?;
    let request = json_body(payload)?;
    let target = OrderStatus::parse(&request.status)?;

    let order = state
        .services
        .orders
        .apply_admin_transition(order_id, target)
        .await?;

    info!(%order_id, status = %order.status, "order status updated by admin");
    Ok(success_response(ApiResponse::success(order)))
}
