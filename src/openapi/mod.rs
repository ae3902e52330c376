use axum::Json;
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Storefront API",
        version = "0.1.0",
        description = "Checkout, payment reconciliation and order lifecycle endpoints"
    ),
    tags(
        (name = "Checkout", description = "Cart to order conversion"),
        (name = "Payments", description = "Payment provider callbacks"),
        (name = "Admin", description = "Operator order management"),
    ),
    paths(
        crate::handlers::checkout::create_checkout,
        crate::handlers::payment_webhooks::payment_webhook,
        crate::handlers::admin_orders::get_order,
        crate::handlers::admin_orders::update_order_status,
    ),
    components(
        schemas(
            crate::errors::ErrorResponse,
            crate::entities::order::OrderStatus,
            crate::services::checkout::CheckoutRequest,
            crate::services::checkout::CheckoutLineInput,
            crate::services::checkout::CheckoutResult,
            crate::services::checkout::ShippingMethod,
            crate::services::orders::AddressInput,
            crate::services::webhook_reconciler::WebhookOutcome,
            crate::handlers::admin_orders::UpdateOrderStatusRequest,
        )
    )
)]
pub struct ApiDocV1;

/// Serves the generated OpenAPI document
pub async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDocV1::openapi())
}
