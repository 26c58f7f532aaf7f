//! Tests for POST /payments/webhook: idempotent license generation.

use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::http::StatusCode;
use serde_json::json;
use tower::ServiceExt;

mod common;
use common::*;

use vtrack_license::db::queries;
use vtrack_license::maintenance;
use vtrack_license::models::OrderStatus;

#[tokio::test]
async fn test_purchase_to_valid_license() {
    let app = create_test_app();

    let created = body_json(
        app.router()
            .oneshot(post_json(
                "/payments",
                &json!({"customerEmail": "a@b.com", "packageCode": "personal_1y"}),
            ))
            .await
            .unwrap(),
    )
    .await;
    let order_code = created["orderCode"].as_i64().unwrap();

    let response = app
        .router()
        .oneshot(post_json(
            "/payments/webhook",
            &webhook_body(order_code, 990_000, "00"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["licenseGenerated"], true);
    assert_eq!(body["emailSent"], true);
    let key = body["licenseKey"].as_str().unwrap().to_string();
    assert!(is_well_formed_key(&key, "VTRACK", "P1Y"), "bad key {}", key);

    let order = queries::get_payment_order(&app.conn(), order_code).unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Completed);

    let license = queries::get_license_by_key(&app.conn(), &key).unwrap().unwrap();
    assert_eq!(license.order_code, Some(order_code));
    assert_eq!(license.customer_email.as_deref(), Some("a@b.com"));
    assert!(license.email_sent_at.is_some());
    assert!(!license.is_trial);

    let validation = body_json(
        app.router()
            .oneshot(get(&format!("/licenses/{}", key)))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(validation["valid"], true);
    assert_eq!(validation["status"], "active");

    let sent = app.mailer.sent.lock().unwrap().clone();
    assert_eq!(sent, vec![("a@b.com".to_string(), key)]);
}

#[tokio::test]
async fn test_redelivery_returns_same_key() {
    let app = create_test_app();
    let order = create_test_order(&app.conn(), "a@b.com", "personal_1m");
    let event = webhook_body(order.order_code, order.amount, "00");

    let first = body_json(app.router().oneshot(post_json("/payments/webhook", &event)).await.unwrap()).await;
    let second = body_json(app.router().oneshot(post_json("/payments/webhook", &event)).await.unwrap()).await;

    assert_eq!(first["licenseKey"], second["licenseKey"]);
    assert_eq!(first["licenseGenerated"], true);
    assert_eq!(second["licenseGenerated"], false);
    assert_eq!(second["alreadyProcessed"], true);
    assert_eq!(second["emailSent"], true);

    assert_eq!(queries::count_licenses_for_order(&app.conn(), order.order_code).unwrap(), 1);
    assert_eq!(app.mailer.sent_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_deliveries_issue_one_license() {
    let app = create_test_app();
    let order = create_test_order(&app.conn(), "a@b.com", "business_1y");
    let event = webhook_body(order.order_code, order.amount, "00");

    let mut tasks = Vec::new();
    for _ in 0..12 {
        let router = app.router();
        let event = event.clone();
        tasks.push(tokio::spawn(async move {
            let response = router
                .oneshot(post_json("/payments/webhook", &event))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            body_json(response).await
        }));
    }

    let mut keys = Vec::new();
    let mut generated = 0;
    for task in tasks {
        let body = task.await.unwrap();
        if body["licenseGenerated"] == true {
            generated += 1;
        }
        keys.push(body["licenseKey"].as_str().unwrap().to_string());
    }

    assert_eq!(generated, 1);
    keys.dedup();
    assert_eq!(keys.len(), 1, "all deliveries must see the same key");
    assert_eq!(queries::count_licenses_for_order(&app.conn(), order.order_code).unwrap(), 1);
    assert_eq!(app.mailer.attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failure_code_marks_order_failed() {
    let app = create_test_app();
    let order = create_test_order(&app.conn(), "a@b.com", "personal_1y");

    let response = app
        .router()
        .oneshot(post_json(
            "/payments/webhook",
            &webhook_body(order.order_code, 0, "01"),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["success"], false);
    assert!(body["message"].as_str().unwrap().contains("01"));

    let order = queries::get_payment_order(&app.conn(), order.order_code).unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Failed);
    assert!(queries::get_license_by_order_code(&app.conn(), order.order_code).unwrap().is_none());
    assert_eq!(app.mailer.attempts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_success_after_failure_completes_order() {
    let app = create_test_app();
    let order = create_test_order(&app.conn(), "a@b.com", "personal_1y");

    app.router()
        .oneshot(post_json("/payments/webhook", &webhook_body(order.order_code, 0, "01")))
        .await
        .unwrap();
    let body = body_json(
        app.router()
            .oneshot(post_json(
                "/payments/webhook",
                &webhook_body(order.order_code, order.amount, "00"),
            ))
            .await
            .unwrap(),
    )
    .await;

    assert_eq!(body["licenseGenerated"], true);
    let order = queries::get_payment_order(&app.conn(), order.order_code).unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Completed);
}

#[tokio::test]
async fn test_completed_order_never_regresses() {
    let app = create_test_app();
    let order = create_test_order(&app.conn(), "a@b.com", "personal_1y");

    let first = body_json(
        app.router()
            .oneshot(post_json(
                "/payments/webhook",
                &webhook_body(order.order_code, order.amount, "00"),
            ))
            .await
            .unwrap(),
    )
    .await;

    let late_failure = app
        .router()
        .oneshot(post_json("/payments/webhook", &webhook_body(order.order_code, 0, "01")))
        .await
        .unwrap();
    assert_eq!(late_failure.status(), StatusCode::OK);

    let stored = queries::get_payment_order(&app.conn(), order.order_code).unwrap().unwrap();
    assert_eq!(stored.status, OrderStatus::Completed);

    let again = body_json(
        app.router()
            .oneshot(post_json(
                "/payments/webhook",
                &webhook_body(order.order_code, order.amount, "00"),
            ))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(again["licenseKey"], first["licenseKey"]);
}

#[tokio::test]
async fn test_email_failure_keeps_license() {
    let app = test_app().mailer(MockMailer::failing()).build();
    let order = create_test_order(&app.conn(), "a@b.com", "personal_lifetime");

    let body = body_json(
        app.router()
            .oneshot(post_json(
                "/payments/webhook",
                &webhook_body(order.order_code, order.amount, "00"),
            ))
            .await
            .unwrap(),
    )
    .await;

    assert_eq!(body["licenseGenerated"], true);
    assert_eq!(body["emailSent"], false);
    // Retried up to the cap, then given up.
    assert_eq!(app.mailer.attempts.load(Ordering::SeqCst), 3);

    let license = queries::get_license_by_order_code(&app.conn(), order.order_code)
        .unwrap()
        .unwrap();
    assert!(license.email_sent_at.is_none());
    assert!(license.expires_at.is_none());
    assert_eq!(
        queries::get_payment_order(&app.conn(), order.order_code).unwrap().unwrap().status,
        OrderStatus::Completed
    );
}

#[tokio::test]
async fn test_slow_email_does_not_fail_licensed_webhook() {
    let app = test_app()
        .mailer(MockMailer::slow(Duration::from_millis(300)))
        .webhook_timeout(Duration::from_millis(100))
        .build();
    let order = create_test_order(&app.conn(), "slow@b.com", "personal_1y");

    let response = app
        .router()
        .oneshot(post_json(
            "/payments/webhook",
            &webhook_body(order.order_code, order.amount, "00"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["licenseGenerated"], true);
    assert_eq!(body["emailSent"], false);
    let key = body["licenseKey"].as_str().unwrap().to_string();
    assert!(is_well_formed_key(&key, "VTRACK", "P1Y"));

    // The send that outlived the deadline still finishes and is recorded.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let license = queries::get_license_by_key(&app.conn(), &key).unwrap().unwrap();
    assert!(license.email_sent_at.is_some());

    let report = maintenance::resend_emails(&app.state, 10).await.unwrap();
    assert_eq!(report.attempted, 0);
    assert_eq!(app.mailer.sent_count(), 1);
    assert_eq!(app.mailer.attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unknown_order_is_bad_request() {
    let app = create_test_app();

    let response = app
        .router()
        .oneshot(post_json("/payments/webhook", &webhook_body(424242, 1000, "00")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["code"], "ORDER_NOT_FOUND");
}

#[tokio::test]
async fn test_malformed_webhook_is_bad_request() {
    let app = create_test_app();

    let response = app
        .router()
        .oneshot(post_json("/payments/webhook", &json!({"code": "00", "data": {"amount": 5}})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_order_code_recovered_from_description() {
    let app = create_test_app();
    let order = create_test_order(&app.conn(), "a@b.com", "personal_1y");

    let body = json!({
        "code": "00",
        "data": {
            "amount": order.amount,
            "description": format!("CT1234 VTRACK {} FT99", order.order_code),
            "code": "00",
        },
    });
    let response = app
        .router()
        .oneshot(post_json("/payments/webhook", &body))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["licenseGenerated"], true);
}

#[tokio::test]
async fn test_completed_order_without_license_is_internal_error() {
    let app = create_test_app();
    let order = create_test_order(&app.conn(), "a@b.com", "personal_1y");
    app.conn()
        .execute(
            "UPDATE payment_orders SET status = 'completed' WHERE order_code = ?1",
            [order.order_code],
        )
        .unwrap();

    let response = app
        .router()
        .oneshot(post_json(
            "/payments/webhook",
            &webhook_body(order.order_code, order.amount, "00"),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(response).await;
    assert_eq!(body["error"], "Internal server error");
    assert!(queries::get_license_by_order_code(&app.conn(), order.order_code).unwrap().is_none());
}

#[tokio::test]
async fn test_signature_required_when_key_configured() {
    let app = test_app()
        .gateway(MockGateway {
            checksum_key: Some(TEST_CHECKSUM_KEY.to_string()),
            ..MockGateway::default()
        })
        .build();
    let order = create_test_order(&app.conn(), "a@b.com", "personal_1y");

    let response = app
        .router()
        .oneshot(post_json(
            "/payments/webhook",
            &webhook_body(order.order_code, order.amount, "00"),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["code"], "INVALID_SIGNATURE");
    assert!(queries::get_license_by_order_code(&app.conn(), order.order_code).unwrap().is_none());
}
