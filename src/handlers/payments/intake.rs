use axum::extract::State;
use serde::{Deserialize, Serialize};

use crate::db::{AppState, queries};
use crate::error::{AppError, Result};
use crate::extractors::{Json, Path};
use crate::models::{CreatePaymentOrder, OrderStatus};
use crate::payments::PaymentLinkRequest;
use crate::retry::{with_retry, with_timeout};
use crate::util::normalize_email;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePaymentRequest {
    pub customer_email: String,
    pub package_code: String,
    /// Where the gateway sends the buyer after paying (defaults to {BASE_URL}/payments/return)
    #[serde(default, rename = "returnURL", alias = "returnUrl")]
    pub return_url: Option<String>,
    #[serde(default, rename = "cancelURL", alias = "cancelUrl")]
    pub cancel_url: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePaymentResponse {
    pub order_code: i64,
    #[serde(rename = "paymentURL")]
    pub payment_url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentStatusResponse {
    pub order_code: i64,
    pub status: OrderStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license_key: Option<String>,
}

fn validate_email(email: &str) -> Result<()> {
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(()),
        _ => Err(AppError::BadRequest("A valid customer email is required".into())),
    }
}

/// Open a pending order, then ask the gateway for a payment link.
///
/// The order is written before the gateway call so a webhook that beats the
/// response can still be correlated. If the gateway fails the order stays
/// `pending` with no payment link.
pub async fn create_payment(
    State(state): State<AppState>,
    Json(request): Json<CreatePaymentRequest>,
) -> Result<Json<CreatePaymentResponse>> {
    let limit = state.write_timeout;
    with_timeout("create_payment", limit, open_order_with_link(&state, request))
        .await
        .map(Json)
}

async fn open_order_with_link(
    state: &AppState,
    request: CreatePaymentRequest,
) -> Result<CreatePaymentResponse> {
    let customer_email = normalize_email(&request.customer_email);
    validate_email(&customer_email)?;

    let package = state
        .catalog
        .get(&request.package_code)
        .ok_or_else(|| AppError::UnknownPackage(request.package_code.clone()))?;

    let order = {
        let conn = state.db.get()?;
        queries::create_payment_order(
            &conn,
            &CreatePaymentOrder {
                customer_email: customer_email.clone(),
                package_code: package.code.clone(),
                amount: package.price,
            },
        )?
    };

    tracing::info!(
        order_code = order.order_code,
        package_code = %package.code,
        amount = order.amount,
        "Payment order opened"
    );

    let link_request = PaymentLinkRequest {
        order_code: order.order_code,
        amount: order.amount,
        description: PaymentLinkRequest::description_for(order.order_code),
        buyer_email: customer_email,
        item_name: package.name.clone(),
        return_url: request
            .return_url
            .unwrap_or_else(|| format!("{}/payments/return", state.base_url)),
        cancel_url: request
            .cancel_url
            .unwrap_or_else(|| format!("{}/payments/cancel", state.base_url)),
    };

    let gateway = state.gateway.as_ref();
    let link = with_retry("create_payment_link", state.retry, || {
        gateway.create_payment_link(&link_request)
    })
    .await
    .inspect_err(|e| {
        tracing::warn!(
            order_code = order.order_code,
            error = %e,
            "Payment link request failed, order left pending"
        );
    })?;

    let conn = state.db.get()?;
    queries::set_order_payment_link(&conn, order.order_code, &link.url, link.link_id.as_deref())?;

    Ok(CreatePaymentResponse {
        order_code: order.order_code,
        payment_url: link.url,
    })
}

/// Client-side status poll for an order.
pub async fn get_payment_status(
    State(state): State<AppState>,
    Path(order_code): Path<i64>,
) -> Result<Json<PaymentStatusResponse>> {
    let conn = state.db.get()?;

    let order = queries::get_payment_order(&conn, order_code)?
        .ok_or_else(|| AppError::NotFound("Order not found".into()))?;
    let license = queries::get_license_by_order_code(&conn, order_code)?;

    Ok(Json(PaymentStatusResponse {
        order_code,
        status: order.status,
        license_key: license.map(|l| l.license_key),
    }))
}
