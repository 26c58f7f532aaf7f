mod payos;

pub use payos::*;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{AppError, Result};

/// Gateway status code for a captured payment.
pub const SUCCESS_CODE: &str = "00";

/// Correlation token embedded in every order description.
pub const DESCRIPTION_PREFIX: &str = "VTRACK";

#[derive(Debug, Clone)]
pub struct PaymentLinkRequest {
    pub order_code: i64,
    pub amount: i64,
    pub description: String,
    pub buyer_email: String,
    pub item_name: String,
    pub return_url: String,
    pub cancel_url: String,
}

impl PaymentLinkRequest {
    pub fn description_for(order_code: i64) -> String {
        format!("{} {}", DESCRIPTION_PREFIX, order_code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentLink {
    pub url: String,
    /// Gateway-side identifier, kept on the order for support lookups
    pub link_id: Option<String>,
}

/// A decoded (and, when a checksum key is configured, authenticated)
/// payment notification.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentWebhookEvent {
    pub order_code: i64,
    pub amount_paid: i64,
    pub status_code: String,
    pub raw_payload: serde_json::Value,
}

impl PaymentWebhookEvent {
    pub fn is_success(&self) -> bool {
        self.status_code == SUCCESS_CODE
    }
}

/// Recover the order code from a free-text transfer description such as
/// `"CT123 VTRACK 4821 FT2401"`.
pub fn order_code_from_description(description: &str) -> Option<i64> {
    let tokens: Vec<&str> = description.split_whitespace().collect();
    tokens
        .windows(2)
        .find(|pair| pair[0].eq_ignore_ascii_case(DESCRIPTION_PREFIX))
        .and_then(|pair| pair[1].parse::<i64>().ok())
        .filter(|code| *code > 0)
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Ask the gateway for a hosted checkout link for an already persisted order.
    async fn create_payment_link(&self, request: &PaymentLinkRequest) -> Result<PaymentLink>;

    /// Decode a raw webhook body, rejecting it if authentication fails.
    fn parse_webhook(&self, body: &[u8]) -> Result<PaymentWebhookEvent>;
}

/// Stand-in used when no gateway credentials are configured. Payment links
/// cannot be created, but webhook bodies are still decoded (unauthenticated).
pub struct UnconfiguredGateway;

#[async_trait]
impl PaymentGateway for UnconfiguredGateway {
    async fn create_payment_link(&self, _request: &PaymentLinkRequest) -> Result<PaymentLink> {
        Err(AppError::Gateway {
            message: "Payment gateway is not configured".into(),
            retryable: false,
        })
    }

    fn parse_webhook(&self, body: &[u8]) -> Result<PaymentWebhookEvent> {
        decode_webhook(body, None)
    }
}
