use std::time::{Duration, Instant};

use axum::{
    body::Bytes,
    extract::State,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use rusqlite::TransactionBehavior;
use serde::Serialize;

use crate::db::{AppState, queries};
use crate::error::{AppError, Result};
use crate::extractors::Json;
use crate::models::{CreateLicense, License, OrderStatus, PaymentOrder};
use crate::payments::PaymentWebhookEvent;
use crate::retry::{with_retry, with_timeout};
use crate::util::expires_after_days;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookLicenseResponse {
    pub license_generated: bool,
    pub license_key: String,
    pub email_sent: bool,
    /// True when the license already existed before this delivery
    pub already_processed: bool,
}

#[derive(Debug, Serialize)]
pub struct WebhookFailureResponse {
    pub success: bool,
    pub message: String,
}

/// What a webhook delivery did.
#[derive(Debug)]
pub enum WebhookOutcome {
    Licensed(WebhookLicenseResponse),
    /// A recognized event for an unsuccessful payment.
    PaymentNotSuccessful { message: String },
}

impl IntoResponse for WebhookOutcome {
    fn into_response(self) -> Response {
        match self {
            WebhookOutcome::Licensed(body) => Json(body).into_response(),
            WebhookOutcome::PaymentNotSuccessful { message } => Json(WebhookFailureResponse {
                success: false,
                message,
            })
            .into_response(),
        }
    }
}

pub async fn handle_payment_webhook(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<WebhookOutcome> {
    let event = state.gateway.parse_webhook(&body).inspect_err(|e| {
        tracing::warn!(error = %e, "Rejected payment webhook");
    })?;

    tracing::info!(
        order_code = event.order_code,
        status_code = %event.status_code,
        amount_paid = event.amount_paid,
        "Payment webhook received"
    );

    process_payment_event(&state, &event).await
}

/// Apply one (possibly redelivered) payment event.
///
/// Safe to call any number of times, concurrently, for the same order: the
/// license insert is keyed by order code, so exactly one caller creates the
/// license and sends the email while everyone else returns the same key.
///
/// `webhook_timeout` bounds license issuance. The email gets whatever is
/// left of it; once the license exists the response always carries it.
pub async fn process_payment_event(
    state: &AppState,
    event: &PaymentWebhookEvent,
) -> Result<WebhookOutcome> {
    if !event.is_success() {
        return record_failed_payment(state, event);
    }

    let started = Instant::now();
    let (license, created) = with_timeout("license_issue", state.webhook_timeout, async {
        issue_license_for_order(state, event)
    })
    .await?;

    if !created {
        return Ok(WebhookOutcome::Licensed(WebhookLicenseResponse {
            license_generated: false,
            email_sent: license.email_sent_at.is_some(),
            license_key: license.license_key,
            already_processed: true,
        }));
    }

    let remaining = state.webhook_timeout.saturating_sub(started.elapsed());
    let email_sent = deliver_license_email_within(state, &license, remaining).await;

    Ok(WebhookOutcome::Licensed(WebhookLicenseResponse {
        license_generated: true,
        license_key: license.license_key,
        email_sent,
        already_processed: false,
    }))
}

/// Returns the order's license and whether this call created it.
fn issue_license_for_order(state: &AppState, event: &PaymentWebhookEvent) -> Result<(License, bool)> {
    let order_code = event.order_code;
    let mut conn = state.db.get()?;

    let order = queries::get_payment_order(&conn, order_code)?.ok_or_else(|| {
        tracing::warn!(order_code, "Webhook for unknown order");
        AppError::OrderNotFound(order_code)
    })?;

    if let Some(existing) = queries::get_license_by_order_code(&conn, order_code)? {
        if order.status != OrderStatus::Completed {
            tracing::error!(
                target: "vtrack_license::operator",
                order_code,
                license_key = %existing.license_key,
                order_status = order.status.as_ref(),
                "License exists but order is not completed"
            );
        }
        tracing::info!(order_code, license_key = %existing.license_key, "Duplicate delivery, returning existing license");
        return Ok((existing, false));
    }

    if order.status == OrderStatus::Completed {
        return Err(AppError::Inconsistent(format!(
            "Order {} is completed but has no license",
            order_code
        )));
    }

    if event.amount_paid < order.amount {
        tracing::warn!(
            order_code,
            amount_paid = event.amount_paid,
            amount_due = order.amount,
            "Payment amount below order amount"
        );
    }

    let input = license_for_order(state, &order)?;

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let created = queries::create_license_for_order(&tx, &input)?;
    if created.is_some() && !queries::transition_order_status(&tx, order_code, OrderStatus::Completed)? {
        tracing::warn!(order_code, "Order status was already terminal when completing");
    }
    tx.commit()?;

    match created {
        Some(license) => {
            tracing::info!(order_code, license_key = %license.license_key, "License issued");
            Ok((license, true))
        }
        None => {
            // Lost the race to a concurrent delivery; return the winner's license.
            let winner = queries::get_license_by_order_code(&conn, order_code)?.ok_or_else(|| {
                AppError::Inconsistent(format!(
                    "License insert for order {} conflicted but no license exists",
                    order_code
                ))
            })?;
            Ok((winner, false))
        }
    }
}

fn license_for_order(state: &AppState, order: &PaymentOrder) -> Result<CreateLicense> {
    let package = state.catalog.get(&order.package_code).ok_or_else(|| {
        AppError::Inconsistent(format!(
            "Order {} references package {} missing from catalog {}",
            order.order_code,
            order.package_code,
            state.catalog.version()
        ))
    })?;

    let now = Utc::now().timestamp();
    Ok(CreateLicense {
        license_key: queries::generate_license_key(&state.license_key_prefix, &package.short_code, now),
        customer_email: Some(order.customer_email.clone()),
        package_code: package.code.clone(),
        display_name: package.name.clone(),
        features: package.features.clone(),
        expires_at: expires_after_days(package.duration_days, now),
        order_code: Some(order.order_code),
        amount: Some(order.amount),
        is_trial: false,
        trial_duration_days: None,
        machine_fingerprint: None,
    })
}

/// Deliver the license email, waiting at most `budget` for the outcome.
///
/// The send runs as its own task so the deadline never cancels a request the
/// provider may already have accepted. A late send still records
/// `email_sent_at` when it finishes, so `resend-emails` will not repeat it.
async fn deliver_license_email_within(state: &AppState, license: &License, budget: Duration) -> bool {
    let task = tokio::spawn({
        let state = state.clone();
        let license = license.clone();
        async move { deliver_license_email(&state, &license).await }
    });

    match tokio::time::timeout(budget, task).await {
        Ok(Ok(sent)) => sent,
        Ok(Err(e)) => {
            tracing::error!(license_key = %license.license_key, error = %e, "License email task failed");
            false
        }
        Err(_) => {
            tracing::warn!(
                license_key = %license.license_key,
                budget_ms = budget.as_millis() as u64,
                "License email still in flight at webhook deadline, finishing in background"
            );
            false
        }
    }
}

/// Best-effort delivery. Failure is logged and left for `resend-emails`;
/// it never affects the license.
pub async fn deliver_license_email(state: &AppState, license: &License) -> bool {
    let Some(to) = license.customer_email.as_deref() else {
        return false;
    };
    let mailer = state.mailer.as_ref();
    let key = license.license_key.as_str();
    let name = license.display_name.as_str();

    let result = with_retry("license_email", state.retry, || mailer.send_license_email(to, key, name)).await;

    match result {
        Ok(sent) if sent.delivered() => {
            let marked = state
                .db
                .get()
                .map_err(AppError::from)
                .and_then(|conn| queries::mark_license_email_sent(&conn, key));
            if let Err(e) = marked {
                tracing::error!(license_key = key, error = %e, "Email sent but delivery time not recorded");
            }
            true
        }
        Ok(_) => false,
        Err(e) => {
            tracing::error!(license_key = key, error = %e, "License email failed, will need resend");
            false
        }
    }
}

fn record_failed_payment(state: &AppState, event: &PaymentWebhookEvent) -> Result<WebhookOutcome> {
    let order_code = event.order_code;
    let conn = state.db.get()?;

    let order = queries::get_payment_order(&conn, order_code)?
        .ok_or(AppError::OrderNotFound(order_code))?;

    if let Some(license) = queries::get_license_by_order_code(&conn, order_code)? {
        tracing::warn!(
            target: "vtrack_license::operator",
            order_code,
            license_key = %license.license_key,
            status_code = %event.status_code,
            "Failure event for an order that already has a license, ignoring"
        );
    } else if queries::transition_order_status(&conn, order_code, OrderStatus::Failed)? {
        tracing::info!(order_code, status_code = %event.status_code, "Order marked failed");
    } else {
        tracing::debug!(order_code, status = order.status.as_ref(), "Failure event did not change order");
    }

    Ok(WebhookOutcome::PaymentNotSuccessful {
        message: format!("Payment not successful (code {})", event.status_code),
    })
}
