#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{Method, Request},
    response::Response,
    Router,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use serde_json::Value;
use storefront_api::{
    config::AppConfig,
    db,
    entities::{order, product, product_variant},
    events::{self, EventSender},
    handlers::AppServices,
    notifications::{NotificationError, Notifier, OrderNotification},
    services::payment_gateway::{
        webhook::SIGNATURE_HEADER, AuthorizationRequest, GatewayError, PaymentAuthorization,
        PaymentGateway, WebhookVerifier,
    },
    AppState,
};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub const WEBHOOK_SECRET: &str = "whsec_integration_test_secret";
pub const ADMIN_TOKEN: &str = "admin-token-for-integration-tests";

/// Payment gateway double that records calls and can be told to fail.
#[derive(Default)]
pub struct FakeGateway {
    fail_authorizations: AtomicBool,
    fixed_reference: Mutex<Option<String>>,
    settle_before_declining: Mutex<Option<Arc<DatabaseConnection>>>,
    authorizations: Mutex<Vec<AuthorizationRequest>>,
    cancellations: Mutex<Vec<String>>,
}

impl FakeGateway {
    pub fn fail_authorizations(&self, fail: bool) {
        self.fail_authorizations.store(fail, Ordering::SeqCst);
    }

    /// Hands out `reference` for every authorization instead of a per-order one.
    pub fn issue_reference(&self, reference: Option<&str>) {
        *self.fixed_reference.lock().unwrap() = reference.map(str::to_string);
    }

    /// Marks the order paid behind checkout's back, then declines the
    /// authorization, so the checkout rollback finds a non-pending order.
    pub fn settle_then_decline(&self, db: Arc<DatabaseConnection>) {
        *self.settle_before_declining.lock().unwrap() = Some(db);
    }

    pub fn authorizations(&self) -> Vec<AuthorizationRequest> {
        self.authorizations.lock().unwrap().clone()
    }

    pub fn cancellations(&self) -> Vec<String> {
        self.cancellations.lock().unwrap().clone()
    }

    pub fn reference_for(order_id: Uuid) -> String {
        format!("pi_test_{}", order_id.simple())
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_authorization(
        &self,
        request: &AuthorizationRequest,
    ) -> Result<PaymentAuthorization, GatewayError> {
        self.authorizations.lock().unwrap().push(request.clone());

        let settle_db = self.settle_before_declining.lock().unwrap().clone();
        if let Some(db) = settle_db {
            order::Entity::update_many()
                .col_expr(order::Column::Status, Expr::value(order::OrderStatus::Paid))
                .filter(order::Column::Id.eq(request.order_id))
                .exec(&*db)
                .await
                .expect("settle order before declining");
            return Err(GatewayError::Status {
                status: 402,
                message: "card_declined".into(),
            });
        }

        if self.fail_authorizations.load(Ordering::SeqCst) {
            return Err(GatewayError::Status {
                status: 402,
                message: "card_declined".into(),
            });
        }
        let reference = self
            .fixed_reference
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Self::reference_for(request.order_id));
        Ok(PaymentAuthorization {
            client_secret: Some(format!("{}_secret", reference)),
            reference,
        })
    }

    async fn cancel_authorization(&self, reference: &str) -> Result<(), GatewayError> {
        self.cancellations.lock().unwrap().push(reference.to_string());
        Ok(())
    }
}

/// Notifier that keeps every notification for later assertions.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<OrderNotification>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<OrderNotification> {
        self.sent.lock().unwrap().clone()
    }

    /// Waits until at least `count` notifications arrived, returning what was seen.
    pub async fn wait_for(&self, count: usize) -> Vec<OrderNotification> {
        for _ in 0..100 {
            let sent = self.sent();
            if sent.len() >= count {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.sent()
    }

    /// Gives the event loop time to deliver anything still queued.
    pub async fn settle(&self) -> Vec<OrderNotification> {
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.sent()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &OrderNotification) -> Result<(), NotificationError> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

/// Application wired against a throwaway SQLite database and test doubles.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub gateway: Arc<FakeGateway>,
    pub notifier: Arc<RecordingNotifier>,
    _event_task: tokio::task::JoinHandle<()>,
    _db_dir: TempDir,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(customize: impl FnOnce(&mut AppConfig)) -> Self {
        let db_dir = tempfile::tempdir().expect("temp dir for test database");
        let db_path = db_dir.path().join("storefront_test.db");

        let mut cfg = AppConfig::new(
            format!("sqlite://{}?mode=rwc", db_path.display()),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.payment_webhook_secret = WEBHOOK_SECRET.to_string();
        cfg.admin_api_token = Some(ADMIN_TOKEN.to_string());
        cfg.webhook_order_lookup_retries = 2;
        cfg.webhook_order_lookup_backoff_ms = 5;
        customize(&mut cfg);

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let db_arc = Arc::new(pool);
        let (event_tx, event_rx) = mpsc::channel(256);
        let event_sender = EventSender::new(event_tx);
        let notifier = Arc::new(RecordingNotifier::default());
        let event_task = tokio::spawn(events::process_events(event_rx, notifier.clone()));

        let gateway = Arc::new(FakeGateway::default());
        let services =
            AppServices::new(db_arc.clone(), &cfg, event_sender.clone(), gateway.clone());

        let state = AppState {
            db: db_arc,
            config: cfg,
            event_sender,
            services,
        };

        Self {
            router: storefront_api::app_router(state.clone()),
            state,
            gateway,
            notifier,
            _event_task: event_task,
            _db_dir: db_dir,
        }
    }

    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        let request = builder.body(body).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    pub async fn checkout(&self, payload: Value) -> Response {
        self.request(Method::POST, "/api/v1/checkout", Some(payload), &[])
            .await
    }

    pub async fn admin_request(&self, method: Method, uri: &str, body: Option<Value>) -> Response {
        let auth = format!("Bearer {}", ADMIN_TOKEN);
        self.request(method, uri, body, &[("authorization", auth.as_str())])
            .await
    }

    /// Posts `event` to the webhook endpoint with a valid signature.
    pub async fn send_webhook(&self, event: &Value) -> Response {
        let payload = serde_json::to_vec(event).expect("serialize webhook");
        let verifier = WebhookVerifier::new(WEBHOOK_SECRET, Duration::from_secs(300));
        let signature = verifier.sign(&payload, Utc::now().timestamp());
        self.send_raw_webhook(payload, Some(&signature)).await
    }

    pub async fn send_raw_webhook(&self, payload: Vec<u8>, signature: Option<&str>) -> Response {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/payments/webhook")
            .header("content-type", "application/json");
        if let Some(signature) = signature {
            builder = builder.header(SIGNATURE_HEADER, signature);
        }
        let request = builder
            .body(Body::from(payload))
            .expect("failed to build webhook request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during webhook request")
    }

    pub async fn seed_product(&self, name: &str, price: Decimal, stock: i32) -> product::Model {
        let now = Utc::now();
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            price: Set(price),
            stock: Set(stock),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed product")
    }

    pub async fn seed_variant(
        &self,
        product_id: Uuid,
        sku: &str,
        price: Option<Decimal>,
        stock: i32,
    ) -> product_variant::Model {
        let now = Utc::now();
        product_variant::ActiveModel {
            id: Set(Uuid::new_v4()),
            product_id: Set(product_id),
            sku: Set(sku.to_string()),
            price: Set(price),
            stock: Set(stock),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed variant")
    }

    pub async fn product_stock(&self, id: Uuid) -> i32 {
        product::Entity::find_by_id(id)
            .one(&*self.state.db)
            .await
            .expect("load product")
            .expect("product exists")
            .stock
    }

    pub async fn variant_stock(&self, id: Uuid) -> i32 {
        product_variant::Entity::find_by_id(id)
            .one(&*self.state.db)
            .await
            .expect("load variant")
            .expect("variant exists")
            .stock
    }

    pub async fn order(&self, id: Uuid) -> Option<order::Model> {
        order::Entity::find_by_id(id)
            .one(&*self.state.db)
            .await
            .expect("load order")
    }

    /// Inserts a pending order directly, bypassing checkout.
    pub async fn insert_pending_order(&self, order_id: Uuid, total: Decimal) -> order::Model {
        let now = Utc::now();
        order::ActiveModel {
            id: Set(order_id),
            order_number: Set(storefront_api::services::orders::generate_order_number()),
            status: Set(order::OrderStatus::Pending),
            customer_id: Set(None),
            customer_email: Set("late@example.com".to_string()),
            currency: Set("USD".to_string()),
            shipping_method: Set("standard".to_string()),
            subtotal: Set(total),
            shipping_total: Set(Decimal::ZERO),
            total: Set(total),
            payment_reference: Set(None),
            needs_reconciliation: Set(false),
            reconciliation_note: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            version: Set(1),
        }
        .insert(&*self.state.db)
        .await
        .expect("insert pending order")
    }

    pub async fn order_count(&self) -> usize {
        order::Entity::find()
            .all(&*self.state.db)
            .await
            .expect("load orders")
            .len()
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}

pub async fn response_json(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}

pub fn decimal_field(value: &Value) -> Decimal {
    match value {
        Value::String(s) => s.parse().expect("decimal string"),
        Value::Number(n) => n.to_string().parse().expect("decimal number"),
        other => panic!("expected decimal, got {}", other),
    }
}

pub fn shipping_address() -> Value {
    serde_json::json!({
        "name": "Ada Lovelace",
        "line1": "12 Analytical Way",
        "city": "London",
        "postal_code": "N1 9GU",
        "country": "GB"
    })
}

/// Checkout body for a single line with standard shipping.
pub fn checkout_payload(product_id: Uuid, quantity: i32, unit_price: Decimal) -> Value {
    serde_json::json!({
        "items": [{
            "product_id": product_id,
            "quantity": quantity,
            "unit_price": unit_price.to_string(),
        }],
        "email": "shopper@example.com",
        "shipping_address": shipping_address(),
        "shipping_method": "standard",
    })
}

/// Payment provider event in the shape the webhook endpoint accepts.
pub fn payment_event(event_id: &str, event_type: &str, object: Value) -> Value {
    serde_json::json!({
        "id": event_id,
        "type": event_type,
        "created": Utc::now().timestamp(),
        "data": { "object": object },
    })
}
