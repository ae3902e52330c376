mod common;

use axum::http::{Method, StatusCode};
use common::{response_json, TestApp};

#[tokio::test]
async fn status_and_health_report_ok() {
    let app = TestApp::new().await;

    let response = app.request(Method::GET, "/api/v1/status", None, &[]).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["data"]["status"], "ok");
    assert_eq!(body["data"]["service"], "storefront-api");

    let response = app.request(Method::GET, "/api/v1/health", None, &[]).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["data"]["checks"]["database"], "healthy");
}

#[tokio::test]
async fn request_id_is_echoed_on_errors() {
    let app = TestApp::new().await;

    let response = app
        .request(
            Method::GET,
            "/api/v1/admin/orders/anything",
            None,
            &[("x-request-id", "trace-me-42")],
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(response.headers().get("x-request-id").unwrap(), "trace-me-42");
    let body = response_json(response).await;
    assert_eq!(body["request_id"], "trace-me-42");
}

#[tokio::test]
async fn openapi_document_is_served() {
    let app = TestApp::new().await;

    let response = app.request(Method::GET, "/api/v1/openapi.json", None, &[]).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["info"]["title"], "Storefront API");
    assert!(body["paths"]["/api/v1/checkout"].is_object());
}
