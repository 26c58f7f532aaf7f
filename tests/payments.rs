//! Tests for POST /payments and GET /payments/{orderCode}.

use std::sync::atomic::Ordering;

use axum::http::StatusCode;
use serde_json::json;
use tower::ServiceExt;

mod common;
use common::*;

use vtrack_license::db::queries;
use vtrack_license::models::OrderStatus;

#[tokio::test]
async fn test_create_payment_opens_pending_order_with_link() {
    let app = create_test_app();

    let response = app
        .router()
        .oneshot(post_json(
            "/payments",
            &json!({"customerEmail": "  Buyer@Example.com ", "packageCode": "personal_1y"}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let order_code = body["orderCode"].as_i64().unwrap();
    assert!(order_code > 0);
    assert_eq!(
        body["paymentURL"],
        format!("https://pay.example/checkout/{}", order_code)
    );

    let order = queries::get_payment_order(&app.conn(), order_code)
        .unwrap()
        .unwrap();
    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.customer_email, "buyer@example.com");
    assert_eq!(order.amount, 990_000);
    assert_eq!(order.payment_link_id.as_deref(), Some(&*format!("link-{}", order_code)));

    let sent = app.gateway.last_request.lock().unwrap().clone().unwrap();
    assert_eq!(sent.description, format!("VTRACK {}", order_code));
    assert_eq!(sent.return_url, "http://localhost:3000/payments/return");
    assert_eq!(sent.cancel_url, "http://localhost:3000/payments/cancel");
}

#[tokio::test]
async fn test_create_payment_passes_caller_urls() {
    let app = create_test_app();

    let response = app
        .router()
        .oneshot(post_json(
            "/payments",
            &json!({
                "customerEmail": "a@b.com",
                "packageCode": "business_lifetime",
                "returnURL": "https://vtrack.app/thanks",
                "cancelURL": "https://vtrack.app/pricing",
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let sent = app.gateway.last_request.lock().unwrap().clone().unwrap();
    assert_eq!(sent.return_url, "https://vtrack.app/thanks");
    assert_eq!(sent.cancel_url, "https://vtrack.app/pricing");
    assert_eq!(sent.amount, 6_990_000);
}

#[tokio::test]
async fn test_create_payment_rejects_invalid_email() {
    let app = create_test_app();

    let response = app
        .router()
        .oneshot(post_json(
            "/payments",
            &json!({"customerEmail": "not-an-email", "packageCode": "personal_1y"}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["code"], "INVALID_INPUT");
    assert_eq!(app.gateway.link_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_create_payment_unknown_package() {
    let app = create_test_app();

    let response = app
        .router()
        .oneshot(post_json(
            "/payments",
            &json!({"customerEmail": "a@b.com", "packageCode": "enterprise_forever"}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"], "Failed to create payment");
    assert_eq!(body["code"], "UNKNOWN_PACKAGE");
}

#[tokio::test]
async fn test_create_payment_missing_fields_is_bad_request() {
    let app = create_test_app();

    let response = app
        .router()
        .oneshot(post_json("/payments", &json!({"customerEmail": "a@b.com"})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_gateway_failure_leaves_order_pending() {
    let app = create_test_app();
    app.gateway.fail_links.store(true, Ordering::SeqCst);

    let response = app
        .router()
        .oneshot(post_json(
            "/payments",
            &json!({"customerEmail": "a@b.com", "packageCode": "personal_1m"}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(response).await;
    assert_eq!(body["error"], "Failed to create payment");
    assert_eq!(body["code"], "GATEWAY_ERROR");

    // Transient failures were retried up to the cap.
    assert_eq!(app.gateway.link_calls.load(Ordering::SeqCst), 3);

    let order_code = app
        .gateway
        .last_request
        .lock()
        .unwrap()
        .as_ref()
        .unwrap()
        .order_code;
    let order = queries::get_payment_order(&app.conn(), order_code)
        .unwrap()
        .unwrap();
    assert_eq!(order.status, OrderStatus::Pending);
    assert!(order.payment_url.is_none());
}

#[tokio::test]
async fn test_each_request_opens_a_new_order() {
    let app = create_test_app();
    let request = json!({"customerEmail": "a@b.com", "packageCode": "personal_1y"});

    let first = body_json(app.router().oneshot(post_json("/payments", &request)).await.unwrap()).await;
    let second = body_json(app.router().oneshot(post_json("/payments", &request)).await.unwrap()).await;

    assert_ne!(first["orderCode"], second["orderCode"]);
}

#[tokio::test]
async fn test_payment_status_poll() {
    let app = create_test_app();
    let order = create_test_order(&app.conn(), "a@b.com", "personal_1y");

    let response = app
        .router()
        .oneshot(get(&format!("/payments/{}", order.order_code)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "pending");
    assert!(body.get("licenseKey").is_none());

    app.router()
        .oneshot(post_json(
            "/payments/webhook",
            &webhook_body(order.order_code, order.amount, "00"),
        ))
        .await
        .unwrap();

    let body = body_json(
        app.router()
            .oneshot(get(&format!("/payments/{}", order.order_code)))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(body["status"], "completed");
    assert!(body["licenseKey"].as_str().unwrap().starts_with("VTRACK-P1Y-"));
}

#[tokio::test]
async fn test_payment_status_unknown_order() {
    let app = create_test_app();

    let response = app.router().oneshot(get("/payments/12345")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app.router().oneshot(get("/payments/abc")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
