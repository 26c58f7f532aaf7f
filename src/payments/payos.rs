use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use super::{PaymentGateway, PaymentLink, PaymentLinkRequest, PaymentWebhookEvent, SUCCESS_CODE};
use crate::config::PayOsConfig;
use crate::error::{AppError, Result};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreatePaymentRequest<'a> {
    order_code: i64,
    amount: i64,
    description: &'a str,
    buyer_email: &'a str,
    items: Vec<PaymentItem<'a>>,
    cancel_url: &'a str,
    return_url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    signature: Option<String>,
}

#[derive(Debug, Serialize)]
struct PaymentItem<'a> {
    name: &'a str,
    quantity: u32,
    price: i64,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    code: String,
    desc: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentLinkData {
    checkout_url: String,
    payment_link_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WebhookBody {
    code: Option<String>,
    data: Option<serde_json::Map<String, Value>>,
    signature: Option<String>,
}

pub struct PayOsClient {
    client: Client,
    client_id: String,
    api_key: String,
    checksum_key: Option<String>,
    api_url: String,
}

impl PayOsClient {
    pub fn new(config: &PayOsConfig, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            client_id: config.client_id.clone(),
            api_key: config.api_key.clone(),
            checksum_key: config.checksum_key.clone(),
            api_url: config.api_url.trim_end_matches('/').to_string(),
        })
    }
}

/// Signature over the fields PayOS requires for a payment request.
fn request_signature(key: &str, request: &PaymentLinkRequest) -> Result<String> {
    let data = format!(
        "amount={}&cancelUrl={}&description={}&orderCode={}&returnUrl={}",
        request.amount,
        request.cancel_url,
        request.description,
        request.order_code,
        request.return_url
    );
    sign(key, &data)
}

fn sign(key: &str, data: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .map_err(|_| AppError::Internal("Invalid checksum key".into()))?;
    mac.update(data.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Canonical `key=value&...` form of a webhook `data` object, keys sorted.
/// Nulls become empty strings; nested values are re-serialized as JSON.
pub fn webhook_signing_string(data: &serde_json::Map<String, Value>) -> String {
    let mut keys: Vec<&String> = data.keys().collect();
    keys.sort();
    keys.into_iter()
        .map(|k| {
            let value = match &data[k] {
                Value::Null => String::new(),
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            format!("{}={}", k, value)
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// Decode a PayOS webhook body. With a checksum key, the body's signature
/// must match the HMAC of its `data` object or the call fails with
/// `Unauthorized`.
pub fn decode_webhook(body: &[u8], checksum_key: Option<&str>) -> Result<PaymentWebhookEvent> {
    let raw_payload: Value = serde_json::from_slice(body)
        .map_err(|e| AppError::BadRequest(format!("Malformed webhook body: {}", e)))?;
    let parsed: WebhookBody = serde_json::from_value(raw_payload.clone())
        .map_err(|e| AppError::BadRequest(format!("Malformed webhook body: {}", e)))?;

    let data = parsed
        .data
        .ok_or_else(|| AppError::BadRequest("Webhook body has no data object".into()))?;

    if let Some(key) = checksum_key {
        let provided = parsed.signature.as_deref().ok_or(AppError::Unauthorized)?;
        let expected = sign(key, &webhook_signing_string(&data))?;
        if !bool::from(expected.as_bytes().ct_eq(provided.to_ascii_lowercase().as_bytes())) {
            return Err(AppError::Unauthorized);
        }
    }

    let order_code = data
        .get("orderCode")
        .and_then(Value::as_i64)
        .or_else(|| {
            data.get("description")
                .and_then(Value::as_str)
                .and_then(super::order_code_from_description)
        })
        .ok_or_else(|| AppError::BadRequest("Webhook does not reference an order".into()))?;

    let amount_paid = data.get("amount").and_then(Value::as_i64).unwrap_or(0);

    let status_code = data
        .get("code")
        .and_then(Value::as_str)
        .map(String::from)
        .or(parsed.code)
        .ok_or_else(|| AppError::BadRequest("Webhook has no status code".into()))?;

    Ok(PaymentWebhookEvent {
        order_code,
        amount_paid,
        status_code,
        raw_payload,
    })
}

fn network_error(e: reqwest::Error) -> AppError {
    AppError::Gateway {
        message: format!("PayOS request failed: {}", e),
        retryable: true,
    }
}

#[async_trait]
impl PaymentGateway for PayOsClient {
    async fn create_payment_link(&self, request: &PaymentLinkRequest) -> Result<PaymentLink> {
        let signature = self
            .checksum_key
            .as_deref()
            .map(|key| request_signature(key, request))
            .transpose()?;

        let body = CreatePaymentRequest {
            order_code: request.order_code,
            amount: request.amount,
            description: &request.description,
            buyer_email: &request.buyer_email,
            items: vec![PaymentItem {
                name: &request.item_name,
                quantity: 1,
                price: request.amount,
            }],
            cancel_url: &request.cancel_url,
            return_url: &request.return_url,
            signature,
        };

        let response = self
            .client
            .post(format!("{}/v2/payment-requests", self.api_url))
            .header("x-client-id", &self.client_id)
            .header("x-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(network_error)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::Gateway {
                message: format!("PayOS returned {}: {}", status, text),
                retryable: status.is_server_error(),
            });
        }

        let parsed: ApiResponse<PaymentLinkData> = response.json().await.map_err(network_error)?;
        match (parsed.code.as_str(), parsed.data) {
            (SUCCESS_CODE, Some(data)) => Ok(PaymentLink {
                url: data.checkout_url,
                link_id: data.payment_link_id,
            }),
            (code, _) => Err(AppError::Gateway {
                message: format!("PayOS rejected payment request ({}): {}", code, parsed.desc),
                retryable: false,
            }),
        }
    }

    fn parse_webhook(&self, body: &[u8]) -> Result<PaymentWebhookEvent> {
        decode_webhook(body, self.checksum_key.as_deref())
    }
}
