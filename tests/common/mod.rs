#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    extract::ConnectInfo,
    http::{Request, Response},
};
use r2d2::PooledConnection;
use r2d2_sqlite::SqliteConnectionManager;
use serde_json::{Value, json};
use tempfile::TempDir;

use vtrack_license::catalog::PackageCatalog;
use vtrack_license::db::{self, AppState, queries};
use vtrack_license::email::{EmailSendResult, LicenseMailer};
use vtrack_license::error::{AppError, Result};
use vtrack_license::handlers;
use vtrack_license::models::*;
use vtrack_license::payments::{
    PaymentGateway, PaymentLink, PaymentLinkRequest, PaymentWebhookEvent, decode_webhook,
};
use vtrack_license::retry::RetryPolicy;

pub const TEST_CHECKSUM_KEY: &str = "test-checksum-key";

/// Gateway double. Records link requests and can be told to fail.
#[derive(Default)]
pub struct MockGateway {
    pub checksum_key: Option<String>,
    pub fail_links: AtomicBool,
    pub link_calls: AtomicUsize,
    pub last_request: Mutex<Option<PaymentLinkRequest>>,
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn create_payment_link(&self, request: &PaymentLinkRequest) -> Result<PaymentLink> {
        self.link_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(request.clone());
        if self.fail_links.load(Ordering::SeqCst) {
            return Err(AppError::Gateway {
                message: "503 Service Unavailable".into(),
                retryable: true,
            });
        }
        Ok(PaymentLink {
            url: format!("https://pay.example/checkout/{}", request.order_code),
            link_id: Some(format!("link-{}", request.order_code)),
        })
    }

    fn parse_webhook(&self, body: &[u8]) -> Result<PaymentWebhookEvent> {
        decode_webhook(body, self.checksum_key.as_deref())
    }
}

/// Mailer double. Counts every attempt; fails all of them when `fail` is set.
/// With `delay_ms` set, each send is accepted first and only returns after the delay.
#[derive(Default)]
pub struct MockMailer {
    pub fail: AtomicBool,
    pub delay_ms: AtomicU64,
    pub attempts: AtomicUsize,
    pub sent: Mutex<Vec<(String, String)>>,
}

impl MockMailer {
    pub fn failing() -> Self {
        let mailer = Self::default();
        mailer.fail.store(true, Ordering::SeqCst);
        mailer
    }

    pub fn slow(delay: Duration) -> Self {
        let mailer = Self::default();
        mailer.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
        mailer
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl LicenseMailer for MockMailer {
    async fn send_license_email(
        &self,
        to: &str,
        license_key: &str,
        _package_name: &str,
    ) -> Result<EmailSendResult> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(AppError::Email {
                message: "502 Bad Gateway".into(),
                retryable: true,
            });
        }
        self.sent
            .lock()
            .unwrap()
            .push((to.to_string(), license_key.to_string()));
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(EmailSendResult::Sent)
    }
}

pub struct TestApp {
    pub state: AppState,
    pub gateway: Arc<MockGateway>,
    pub mailer: Arc<MockMailer>,
    _dir: TempDir,
}

impl TestApp {
    pub fn router(&self) -> Router {
        handlers::app(self.state.clone())
    }

    pub fn conn(&self) -> PooledConnection<SqliteConnectionManager> {
        self.state.db.get().unwrap()
    }
}

pub struct TestAppBuilder {
    policy: TrialPolicy,
    gateway: MockGateway,
    mailer: MockMailer,
    webhook_timeout: Duration,
}

impl TestAppBuilder {
    pub fn webhook_timeout(mut self, timeout: Duration) -> Self {
        self.webhook_timeout = timeout;
        self
    }

    pub fn policy(mut self, policy: TrialPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn gateway(mut self, gateway: MockGateway) -> Self {
        self.gateway = gateway;
        self
    }

    pub fn mailer(mut self, mailer: MockMailer) -> Self {
        self.mailer = mailer;
        self
    }

    pub fn build(self) -> TestApp {
        // File-backed so concurrent connections share one database.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let pool = db::create_pool(path.to_str().unwrap(), Duration::from_secs(10)).unwrap();
        queries::ensure_trial_policy(&pool.get().unwrap(), &self.policy).unwrap();

        let gateway = Arc::new(self.gateway);
        let mailer = Arc::new(self.mailer);

        let state = AppState {
            db: pool,
            catalog: Arc::new(PackageCatalog::builtin()),
            gateway: gateway.clone(),
            mailer: mailer.clone(),
            base_url: "http://localhost:3000".to_string(),
            license_key_prefix: "VTRACK".to_string(),
            write_timeout: Duration::from_secs(30),
            webhook_timeout: self.webhook_timeout,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
            },
        };

        TestApp {
            state,
            gateway,
            mailer,
            _dir: dir,
        }
    }
}

pub fn test_app() -> TestAppBuilder {
    TestAppBuilder {
        policy: TrialPolicy::default(),
        gateway: MockGateway::default(),
        mailer: MockMailer::default(),
        webhook_timeout: Duration::from_secs(60),
    }
}

pub fn create_test_app() -> TestApp {
    test_app().build()
}

// ============ Requests ============

pub fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn post_json_from(uri: &str, body: &Value, client_ip: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-forwarded-for", client_ip)
        .body(Body::from(body.to_string()))
        .unwrap()
}

/// A request with no proxy headers, arriving from socket address `peer`.
pub fn post_json_from_peer(uri: &str, body: &Value, peer: &str) -> Request<Body> {
    let mut request = post_json(uri, body);
    let addr: SocketAddr = peer.parse().unwrap();
    request.extensions_mut().insert(ConnectInfo(addr));
    request
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

// ============ Fixtures ============

pub fn create_test_order(conn: &rusqlite::Connection, email: &str, package_code: &str) -> PaymentOrder {
    let package = PackageCatalog::builtin().get(package_code).cloned().unwrap();
    queries::create_payment_order(
        conn,
        &CreatePaymentOrder {
            customer_email: email.to_string(),
            package_code: package.code,
            amount: package.price,
        },
    )
    .unwrap()
}

/// PayOS-shaped webhook body for `order_code`.
pub fn webhook_body(order_code: i64, amount: i64, code: &str) -> Value {
    json!({
        "code": code,
        "desc": if code == "00" { "success" } else { "failed" },
        "success": code == "00",
        "data": {
            "orderCode": order_code,
            "amount": amount,
            "description": format!("VTRACK {}", order_code),
            "code": code,
            "desc": if code == "00" { "Thành công" } else { "Thất bại" },
            "reference": "FT24001",
            "transactionDateTime": "2024-11-20 10:00:00",
        },
        "signature": "unsigned",
    })
}

/// Insert a license directly, bypassing issuance.
pub fn create_test_license(
    conn: &rusqlite::Connection,
    email: Option<&str>,
    expires_at: Option<i64>,
) -> License {
    let now = chrono::Utc::now().timestamp();
    queries::create_license(
        conn,
        &CreateLicense {
            license_key: queries::generate_license_key("VTRACK", "P1Y", now),
            customer_email: email.map(String::from),
            package_code: "personal_1y".into(),
            display_name: "VTrack Personal (1 year)".into(),
            features: vec!["video_processing".into()],
            expires_at,
            order_code: None,
            amount: Some(990_000),
            is_trial: false,
            trial_duration_days: None,
            machine_fingerprint: None,
        },
    )
    .unwrap()
}

/// True if `key` looks like `PREFIX-PKG-TIMESTAMP-XXXXXXXX`.
pub fn is_well_formed_key(key: &str, prefix: &str, pkg: &str) -> bool {
    let parts: Vec<&str> = key.split('-').collect();
    parts.len() == 4
        && parts[0] == prefix
        && parts[1] == pkg
        && parts[2].len() == 10
        && parts[2].chars().all(|c| c.is_ascii_digit())
        && parts[3].len() == 8
        && parts[3]
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
}

pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}
