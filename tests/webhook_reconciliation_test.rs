//! Integration tests for payment webhook reconciliation.

mod common;

use axum::http::StatusCode;
use chrono::Utc;
use common::{checkout_payload, payment_event, response_json, FakeGateway, TestApp};
use rust_decimal_macros::dec;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use storefront_api::{
    entities::{
        order::OrderStatus,
        order_address::{self, AddressKind},
        processed_webhook_event::{self, LedgerOutcome},
    },
    notifications::NotificationKind,
    services::payment_gateway::webhook::{sign_payload, FALLBACK_SIGNATURE_HEADER},
};
use uuid::Uuid;

/// Runs a checkout and returns the new order id.
async fn place_order(app: &TestApp) -> Uuid {
    let product = app.seed_product("Widget", dec!(10.00), 10).await;
    let response = app.checkout(checkout_payload(product.id, 1, dec!(10.00))).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = response_json(response).await;
    body["order_id"].as_str().unwrap().parse().unwrap()
}

async fn ledger_rows(app: &TestApp) -> Vec<processed_webhook_event::Model> {
    processed_webhook_event::Entity::find()
        .all(&*app.state.db)
        .await
        .unwrap()
}

#[tokio::test]
async fn authorization_success_marks_order_paid() {
    let app = TestApp::new().await;
    let order_id = place_order(&app).await;
    let reference = FakeGateway::reference_for(order_id);

    let event = payment_event("evt_paid_1", "payment_intent.succeeded", json!({ "id": reference }));
    let response = app.send_webhook(&event).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["received"], true);
    assert_eq!(body["outcome"], "applied");

    let order = app.order(order_id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Paid);
    assert_eq!(order.version, 2);

    let sent = app.notifier.wait_for(2).await;
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].kind, NotificationKind::PaymentReceived);
    assert_eq!(sent[1].order_id, order_id);

    let ledger = ledger_rows(&app).await;
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].event_id, "evt_paid_1");
    assert_eq!(ledger[0].order_id, Some(order_id));
    assert_eq!(ledger[0].outcome, LedgerOutcome::Applied);
}

#[tokio::test]
async fn duplicate_delivery_is_processed_once() {
    let app = TestApp::new().await;
    let order_id = place_order(&app).await;
    let event = payment_event(
        "evt_dup",
        "payment_intent.succeeded",
        json!({ "id": FakeGateway::reference_for(order_id) }),
    );

    let first = response_json(app.send_webhook(&event).await).await;
    assert_eq!(first["outcome"], "applied");
    let second = app.send_webhook(&event).await;
    assert_eq!(second.status(), StatusCode::OK);
    let second = response_json(second).await;
    assert_eq!(second["outcome"], "already_processed");

    let sent = app.notifier.settle().await;
    let paid: Vec<_> = sent
        .iter()
        .filter(|n| n.kind == NotificationKind::PaymentReceived)
        .collect();
    assert_eq!(paid.len(), 1);
    assert_eq!(ledger_rows(&app).await.len(), 1);
}

#[tokio::test]
async fn bad_signatures_are_rejected_without_side_effects() {
    let app = TestApp::new().await;
    let order_id = place_order(&app).await;
    let event = payment_event(
        "evt_forged",
        "payment_intent.succeeded",
        json!({ "id": FakeGateway::reference_for(order_id) }),
    );
    let payload = serde_json::to_vec(&event).unwrap();

    let response = app.send_raw_webhook(payload.clone(), None).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let forged = format!(
        "t={},v1={}",
        Utc::now().timestamp(),
        sign_payload("wrong_secret", Utc::now().timestamp(), &payload)
    );
    let response = app.send_raw_webhook(payload.clone(), Some(&forged)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = response_json(response).await;
    assert_eq!(body["details"], "invalid_signature");

    // Correct secret but outside the replay window
    let stale_ts = Utc::now().timestamp() - 3600;
    let stale = format!(
        "t={},v1={}",
        stale_ts,
        sign_payload(common::WEBHOOK_SECRET, stale_ts, &payload)
    );
    let response = app.send_raw_webhook(payload, Some(&stale)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    assert_eq!(app.order(order_id).await.unwrap().status, OrderStatus::Pending);
    assert!(ledger_rows(&app).await.is_empty());
}

#[tokio::test]
async fn fallback_signature_header_is_accepted() {
    let app = TestApp::new().await;
    let order_id = place_order(&app).await;
    let event = payment_event(
        "evt_fallback",
        "payment_intent.succeeded",
        json!({ "id": FakeGateway::reference_for(order_id) }),
    );
    let payload = serde_json::to_vec(&event).unwrap();
    let ts = Utc::now().timestamp();
    let signature = format!("t={},v1={}", ts, sign_payload(common::WEBHOOK_SECRET, ts, &payload));

    let response = app
        .request(
            axum::http::Method::POST,
            "/api/v1/payments/webhook",
            Some(event),
            &[(FALLBACK_SIGNATURE_HEADER, signature.as_str())],
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(app.order(order_id).await.unwrap().status, OrderStatus::Paid);
}

#[tokio::test]
async fn orders_resolve_through_metadata_when_reference_is_unknown() {
    let app = TestApp::new().await;
    let by_number = place_order(&app).await;
    let by_id = place_order(&app).await;
    let order_number = app.order(by_number).await.unwrap().order_number;

    let event = payment_event(
        "evt_by_number",
        "payment_intent.succeeded",
        json!({ "id": "pi_unknown_1", "metadata": { "order_number": order_number } }),
    );
    let body = response_json(app.send_webhook(&event).await).await;
    assert_eq!(body["outcome"], "applied");
    assert_eq!(app.order(by_number).await.unwrap().status, OrderStatus::Paid);

    let event = payment_event(
        "evt_by_id",
        "charge.succeeded",
        json!({
            "id": "ch_unknown_2",
            "payment_intent": "pi_unknown_2",
            "metadata": { "order_id": by_id.to_string() }
        }),
    );
    let body = response_json(app.send_webhook(&event).await).await;
    assert_eq!(body["outcome"], "applied");
    let order = app.order(by_id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Paid);
    // The reference recorded at checkout is kept
    assert_eq!(
        order.payment_reference.as_deref(),
        Some(FakeGateway::reference_for(by_id).as_str())
    );
}

#[tokio::test]
async fn unresolvable_events_ask_for_redelivery() {
    let app = TestApp::new().await;

    let event = payment_event(
        "evt_orphan",
        "payment_intent.succeeded",
        json!({ "id": "pi_does_not_exist" }),
    );
    let response = app.send_webhook(&event).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = response_json(response).await;
    assert_eq!(body["details"], "order_not_found");

    // Nothing recorded, so a later redelivery is processed normally
    assert!(ledger_rows(&app).await.is_empty());
}

#[tokio::test]
async fn cancelled_orders_are_not_revived_by_late_success() {
    let app = TestApp::new().await;
    let order_id = place_order(&app).await;
    let reference = FakeGateway::reference_for(order_id);

    let failed = payment_event(
        "evt_failed",
        "payment_intent.payment_failed",
        json!({ "id": reference }),
    );
    let body = response_json(app.send_webhook(&failed).await).await;
    assert_eq!(body["outcome"], "applied");
    assert_eq!(app.order(order_id).await.unwrap().status, OrderStatus::Cancelled);

    let late = payment_event(
        "evt_late_success",
        "payment_intent.succeeded",
        json!({ "id": reference }),
    );
    let response = app.send_webhook(&late).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["outcome"], "ignored");

    let order = app.order(order_id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Cancelled);
    assert!(order.needs_reconciliation);
    assert!(order.reconciliation_note.is_some());

    let sent = app.notifier.settle().await;
    assert_eq!(
        sent.iter()
            .filter(|n| n.kind == NotificationKind::OrderCancelled)
            .count(),
        1
    );
    assert!(sent.iter().all(|n| n.kind != NotificationKind::PaymentReceived));

    let ledger = ledger_rows(&app).await;
    let late_row = ledger
        .iter()
        .find(|row| row.event_id == "evt_late_success")
        .expect("late event recorded");
    assert_eq!(late_row.outcome, LedgerOutcome::Ignored);
}

#[tokio::test]
async fn repeated_charge_success_leaves_paid_order_unchanged() {
    let app = TestApp::new().await;
    let order_id = place_order(&app).await;
    let reference = FakeGateway::reference_for(order_id);

    let paid = payment_event("evt_a", "payment_intent.succeeded", json!({ "id": reference }));
    app.send_webhook(&paid).await;

    let charge = payment_event(
        "evt_b",
        "charge.succeeded",
        json!({ "id": "ch_1", "payment_intent": reference }),
    );
    let body = response_json(app.send_webhook(&charge).await).await;
    assert_eq!(body["outcome"], "unchanged");
    assert_eq!(app.order(order_id).await.unwrap().status, OrderStatus::Paid);
}

#[tokio::test]
async fn unhandled_event_types_are_acknowledged() {
    let app = TestApp::new().await;

    let event = payment_event("evt_other", "customer.created", json!({ "id": "cus_1" }));
    let response = app.send_webhook(&event).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["outcome"], "ignored");

    let ledger = ledger_rows(&app).await;
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].outcome, LedgerOutcome::Ignored);
    assert_eq!(ledger[0].order_id, None);

    let body = response_json(app.send_webhook(&event).await).await;
    assert_eq!(body["outcome"], "already_processed");
}

#[tokio::test]
async fn provider_shipping_details_update_the_order_address() {
    let app = TestApp::new().await;
    let order_id = place_order(&app).await;

    let event = payment_event(
        "evt_shipping",
        "payment_intent.succeeded",
        json!({
            "id": FakeGateway::reference_for(order_id),
            "shipping": {
                "name": "Grace Hopper",
                "phone": "+1 555 0100",
                "address": {
                    "line1": "1 Compiler Court",
                    "city": "Arlington",
                    "state": "VA",
                    "postal_code": "22201",
                    "country": "us"
                }
            }
        }),
    );
    let response = app.send_webhook(&event).await;
    assert_eq!(response.status(), StatusCode::OK);

    let shipping = order_address::Entity::find()
        .filter(order_address::Column::OrderId.eq(order_id))
        .filter(order_address::Column::Kind.eq(AddressKind::Shipping))
        .all(&*app.state.db)
        .await
        .unwrap();
    assert_eq!(shipping.len(), 1);
    assert_eq!(shipping[0].name, "Grace Hopper");
    assert_eq!(shipping[0].country, "US");
    assert_eq!(shipping[0].region.as_deref(), Some("VA"));
}

#[tokio::test]
async fn malformed_payloads_are_bad_requests() {
    let app = TestApp::new().await;
    let payload = b"{not json".to_vec();
    let ts = Utc::now().timestamp();
    let signature = format!("t={},v1={}", ts, sign_payload(common::WEBHOOK_SECRET, ts, &payload));

    let response = app.send_raw_webhook(payload, Some(&signature)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn concurrent_duplicate_deliveries_apply_once() {
    let app = TestApp::new().await;
    let order_id = place_order(&app).await;
    let event = payment_event(
        "evt_twice_at_once",
        "payment_intent.succeeded",
        json!({ "id": FakeGateway::reference_for(order_id) }),
    );

    let (first, second) = tokio::join!(app.send_webhook(&event), app.send_webhook(&event));
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(second.status(), StatusCode::OK);

    let mut outcomes = vec![
        response_json(first).await["outcome"].as_str().unwrap().to_string(),
        response_json(second).await["outcome"].as_str().unwrap().to_string(),
    ];
    outcomes.sort();
    assert_eq!(outcomes, vec!["already_processed", "applied"]);

    let order = app.order(order_id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Paid);
    assert_eq!(order.version, 2);
    assert_eq!(ledger_rows(&app).await.len(), 1);

    // Order confirmation plus a single payment notification
    let sent = app.notifier.settle().await;
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].kind, NotificationKind::PaymentReceived);
}

#[tokio::test]
async fn order_committed_during_lookup_backoff_is_reconciled() {
    let app = Arc::new(
        TestApp::with_config(|cfg| {
            cfg.webhook_order_lookup_retries = 8;
            cfg.webhook_order_lookup_backoff_ms = 20;
        })
        .await,
    );
    let order_id = Uuid::new_v4();
    let event = payment_event(
        "evt_before_commit",
        "payment_intent.succeeded",
        json!({ "id": "pi_before_commit", "metadata": { "order_id": order_id.to_string() } }),
    );

    let delivery = {
        let app = app.clone();
        tokio::spawn(async move {
            let response = app.send_webhook(&event).await;
            (response.status(), response_json(response).await)
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    app.insert_pending_order(order_id, dec!(10.00)).await;

    let (status, body) = delivery.await.expect("webhook task panicked");
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "applied");

    let order = app.order(order_id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Paid);
    assert_eq!(order.payment_reference.as_deref(), Some("pi_before_commit"));

    let ledger = ledger_rows(&app).await;
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].order_id, Some(order_id));
}
