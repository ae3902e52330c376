mod common;

use axum::http::StatusCode;
use common::{checkout_payload, TestApp};
use rust_decimal_macros::dec;
use std::sync::Arc;

// STOCK + 1 concurrent single-unit checkouts; exactly STOCK may win.
#[tokio::test]
async fn concurrent_checkouts_never_oversell() {
    const STOCK: i32 = 5;

    let app = Arc::new(
        TestApp::with_config(|cfg| {
            cfg.db_max_connections = 4;
        })
        .await,
    );
    let product = app.seed_product("Limited", dec!(10.00), STOCK).await;

    let mut tasks = vec![];
    for _ in 0..=STOCK {
        let app = app.clone();
        let payload = checkout_payload(product.id, 1, dec!(10.00));
        tasks.push(tokio::spawn(async move { app.checkout(payload).await.status() }));
    }

    let mut created = 0;
    let mut conflicts = 0;
    for task in tasks {
        match task.await.expect("checkout task panicked") {
            StatusCode::CREATED => created += 1,
            StatusCode::CONFLICT => conflicts += 1,
            other => panic!("unexpected status {}", other),
        }
    }

    assert_eq!(created, STOCK, "exactly {} checkouts should succeed", STOCK);
    assert_eq!(conflicts, 1);
    assert_eq!(app.product_stock(product.id).await, 0);
    assert_eq!(app.order_count().await, STOCK as usize);
}
