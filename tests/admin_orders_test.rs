mod common;

use axum::http::{Method, StatusCode};
use common::{checkout_payload, payment_event, response_json, FakeGateway, TestApp, ADMIN_TOKEN};
use rust_decimal_macros::dec;
use serde_json::json;
use storefront_api::{entities::order::OrderStatus, notifications::NotificationKind};
use uuid::Uuid;

async fn paid_order(app: &TestApp) -> Uuid {
    let product = app.seed_product("Widget", dec!(10.00), 10).await;
    let body = response_json(app.checkout(checkout_payload(product.id, 1, dec!(10.00))).await).await;
    let order_id: Uuid = body["order_id"].as_str().unwrap().parse().unwrap();

    let event = payment_event(
        &format!("evt_paid_{}", order_id.simple()),
        "payment_intent.succeeded",
        json!({ "id": FakeGateway::reference_for(order_id) }),
    );
    assert_eq!(app.send_webhook(&event).await.status(), StatusCode::OK);
    order_id
}

async fn set_status(app: &TestApp, order_id: Uuid, status: &str) -> axum::response::Response {
    app.admin_request(
        Method::PUT,
        &format!("/api/v1/admin/orders/{}/status", order_id),
        Some(json!({ "status": status })),
    )
    .await
}

#[tokio::test]
async fn admin_routes_require_the_operator_token() {
    let app = TestApp::new().await;
    let order_id = paid_order(&app).await;
    let uri = format!("/api/v1/admin/orders/{}", order_id);

    let response = app.request(Method::GET, &uri, None, &[]).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .request(Method::GET, &uri, None, &[("authorization", "Bearer not-the-token")])
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .request(
            Method::PUT,
            &format!("{}/status", uri),
            Some(json!({ "status": "cancelled" })),
            &[],
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(app.order(order_id).await.unwrap().status, OrderStatus::Paid);
}

#[tokio::test]
async fn admin_disabled_without_configured_token() {
    let app = TestApp::with_config(|cfg| cfg.admin_api_token = None).await;
    let auth = format!("Bearer {}", ADMIN_TOKEN);
    let response = app
        .request(
            Method::GET,
            &format!("/api/v1/admin/orders/{}", Uuid::new_v4()),
            None,
            &[("authorization", auth.as_str())],
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn get_order_returns_items_and_addresses() {
    let app = TestApp::new().await;
    let order_id = paid_order(&app).await;

    let response = app
        .admin_request(Method::GET, &format!("/api/v1/admin/orders/{}", order_id), None)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["id"], order_id.to_string());
    assert_eq!(body["data"]["status"], "paid");
    assert_eq!(body["data"]["items"].as_array().unwrap().len(), 1);
    assert_eq!(body["data"]["addresses"].as_array().unwrap().len(), 1);

    let response = app
        .admin_request(Method::GET, &format!("/api/v1/admin/orders/{}", Uuid::new_v4()), None)
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .admin_request(Method::GET, "/api/v1/admin/orders/not-a-uuid", None)
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn fulfilment_moves_forward_one_step_at_a_time() {
    let app = TestApp::new().await;
    let order_id = paid_order(&app).await;

    // Skipping a step is refused
    let response = set_status(&app, order_id, "shipped").await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = response_json(response).await;
    assert_eq!(body["details"], "invalid_transition");

    for status in ["processing", "shipped", "delivered"] {
        let response = set_status(&app, order_id, status).await;
        assert_eq!(response.status(), StatusCode::OK, "moving to {}", status);
        let body = response_json(response).await;
        assert_eq!(body["data"]["status"], status);
    }

    let order = app.order(order_id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Delivered);

    // Delivered is terminal
    let response = set_status(&app, order_id, "cancelled").await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = response_json(response).await;
    assert_eq!(body["details"], "terminal_state");

    let sent = app.notifier.wait_for(5).await;
    assert_eq!(
        sent.iter()
            .filter(|n| n.kind == NotificationKind::StatusUpdate)
            .count(),
        3
    );
}

#[tokio::test]
async fn cancellation_is_allowed_before_delivery() {
    let app = TestApp::new().await;
    let order_id = paid_order(&app).await;

    let response = set_status(&app, order_id, "cancelled").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(app.order(order_id).await.unwrap().status, OrderStatus::Cancelled);

    let sent = app.notifier.wait_for(3).await;
    assert!(sent.iter().any(|n| n.kind == NotificationKind::OrderCancelled));

    let response = set_status(&app, order_id, "processing").await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn unknown_status_is_a_bad_request() {
    let app = TestApp::new().await;
    let order_id = paid_order(&app).await;

    let response = set_status(&app, order_id, "teleported").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = response_json(response).await;
    assert_eq!(body["details"], "invalid_status");
    assert_eq!(app.order(order_id).await.unwrap().status, OrderStatus::Paid);
}
