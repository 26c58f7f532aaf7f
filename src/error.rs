use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::models::TrialDenial;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Caller error. Never retried automatically.
    #[error("{0}")]
    BadRequest(String),

    #[error("Unknown package: {0}")]
    UnknownPackage(String),

    #[error("{0}")]
    NotFound(String),

    /// A webhook referenced an order this service never opened.
    #[error("Order {0} not found")]
    OrderNotFound(i64),

    #[error("Invalid webhook signature")]
    Unauthorized,

    /// The machine cannot receive a trial; the reason is always reported.
    #[error("{}", .0.message())]
    TrialDenied(TrialDenial),

    #[error("Payment gateway error: {message}")]
    Gateway { message: String, retryable: bool },

    #[error("Email delivery error: {message}")]
    Email { message: String, retryable: bool },

    /// An internal invariant does not hold. Logged for operators, never repaired inline.
    #[error("Inconsistent state: {0}")]
    Inconsistent(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    /// Transient dependency failures that are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Gateway { retryable, .. } | AppError::Email { retryable, .. } => *retryable,
            AppError::Timeout(_) => true,
            _ => false,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_)
            | AppError::UnknownPackage(_)
            | AppError::OrderNotFound(_)
            | AppError::TrialDenied(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Gateway { .. }
            | AppError::Email { .. }
            | AppError::Inconsistent(_)
            | AppError::Internal(_)
            | AppError::Database(_)
            | AppError::Pool(_)
            | AppError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code returned alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::BadRequest(_) => "INVALID_INPUT",
            AppError::UnknownPackage(_) => "UNKNOWN_PACKAGE",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::OrderNotFound(_) => "ORDER_NOT_FOUND",
            AppError::Unauthorized => "INVALID_SIGNATURE",
            AppError::TrialDenied(denial) => denial.reason(),
            AppError::Gateway { .. } => "GATEWAY_ERROR",
            AppError::Timeout(_) => "TIMEOUT",
            AppError::Email { .. }
            | AppError::Inconsistent(_)
            | AppError::Internal(_)
            | AppError::Database(_)
            | AppError::Pool(_)
            | AppError::Json(_) => "INTERNAL_ERROR",
        }
    }

    /// Errors whose detail stays server-side.
    fn is_internal(&self) -> bool {
        self.status_code().is_server_error()
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();

        let body = match &self {
            AppError::TrialDenied(denial) => {
                let error = match denial {
                    TrialDenial::Disabled => "trial disabled",
                    TrialDenial::AlreadyUsed { .. } => "already used",
                    TrialDenial::AbuseDetected(_) => "abuse detected",
                };
                json!({
                    "error": error,
                    "reason": denial.reason(),
                    "message": denial.message(),
                    "activatedAt": denial.activated_at(),
                })
            }
            AppError::UnknownPackage(_) => json!({
                "error": "Failed to create payment",
                "code": code,
                "message": self.to_string(),
            }),
            AppError::Gateway { .. } => {
                tracing::error!(error = %self, "Payment gateway failure");
                json!({ "error": "Failed to create payment", "code": code })
            }
            _ if self.is_internal() => {
                if matches!(self, AppError::Inconsistent(_)) {
                    tracing::error!(target: "vtrack_license::operator", error = %self, "Inconsistent state surfaced to caller");
                } else {
                    tracing::error!(error = %self, "Internal error");
                }
                json!({ "error": "Internal server error", "code": code })
            }
            _ => json!({ "error": self.to_string(), "code": code }),
        };

        (status, Json(body)).into_response()
    }
}
