//! License delivery email.
//!
//! Supports two modes:
//! 1. Send via Resend API (when an API key is configured)
//! 2. Disabled (no email sent, log only)
//!
//! Delivery is best-effort: the license row is the source of truth and
//! `resend-emails` retries anything that never went out.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

const RESEND_API_URL: &str = "https://api.resend.com/emails";

/// Result of attempting to send a license email.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailSendResult {
    /// Email was accepted by Resend
    Sent,
    /// No API key configured; nothing was sent
    NoApiKey,
}

impl EmailSendResult {
    pub fn delivered(self) -> bool {
        matches!(self, EmailSendResult::Sent)
    }
}

#[async_trait]
pub trait LicenseMailer: Send + Sync {
    async fn send_license_email(
        &self,
        to: &str,
        license_key: &str,
        package_name: &str,
    ) -> Result<EmailSendResult>;
}

/// Resend API request body.
#[derive(Debug, Serialize)]
struct ResendEmailRequest<'a> {
    from: &'a str,
    to: Vec<&'a str>,
    subject: String,
    text: String,
    html: String,
}

/// Resend API response.
#[derive(Debug, Deserialize)]
struct ResendEmailResponse {
    #[allow(dead_code)]
    id: String,
}

#[derive(Clone)]
pub struct ResendMailer {
    api_key: Option<String>,
    from_email: String,
    http_client: Client,
}

impl ResendMailer {
    pub fn new(api_key: Option<String>, from_email: String, timeout: Duration) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            api_key,
            from_email,
            http_client,
        })
    }
}

fn render(license_key: &str, package_name: &str) -> (String, String, String) {
    let subject = format!("Your {} license key", package_name);
    let text = format!(
        "Thank you for purchasing {}.\n\nYour license key:\n\n{}\n\nEnter this key in VTrack under Settings > License to activate.\n\nKeep this email; the key is all you need to reactivate on a new machine.",
        package_name, license_key
    );
    let html = format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"></head>
<body style="font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; max-width: 600px; margin: 0 auto; padding: 20px;">
<h2 style="color: #333;">Thank you for purchasing {}</h2>
<p>Your license key:</p>
<div style="background: #f5f5f5; padding: 20px; border-radius: 8px; text-align: center;">
<code style="font-size: 20px; font-weight: bold; letter-spacing: 1px; color: #333;">{}</code>
</div>
<p>Enter this key in <strong>VTrack</strong> under Settings &gt; License to activate.</p>
<hr style="border: none; border-top: 1px solid #eee; margin: 30px 0;">
<p style="color: #999; font-size: 12px;">Keep this email; the key is all you need to reactivate on a new machine.</p>
</body>
</html>"#,
        package_name, license_key
    );
    (subject, text, html)
}

#[async_trait]
impl LicenseMailer for ResendMailer {
    async fn send_license_email(
        &self,
        to: &str,
        license_key: &str,
        package_name: &str,
    ) -> Result<EmailSendResult> {
        let Some(api_key) = self.api_key.as_deref() else {
            tracing::warn!(license_key, "No Resend API key configured, license email not sent");
            return Ok(EmailSendResult::NoApiKey);
        };

        let (subject, text, html) = render(license_key, package_name);
        let request = ResendEmailRequest {
            from: &self.from_email,
            to: vec![to],
            subject,
            text,
            html,
        };

        let response = self
            .http_client
            .post(RESEND_API_URL)
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| AppError::Email {
                message: e.to_string(),
                retryable: true,
            })?;

        let status = response.status();
        if status.is_success() {
            let _result: ResendEmailResponse = response.json().await.map_err(|e| AppError::Email {
                message: format!("Unreadable Resend response: {}", e),
                retryable: false,
            })?;
            tracing::info!(to, license_key, "License email sent via Resend");
            Ok(EmailSendResult::Sent)
        } else {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Resend API returned error");
            Err(AppError::Email {
                message: format!("{} - {}", status, body),
                retryable: status.is_server_error() || status.as_u16() == 429,
            })
        }
    }
}
