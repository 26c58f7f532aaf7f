mod intake;
mod webhook;

pub use intake::*;
pub use webhook::*;

use axum::{
    Router,
    routing::{get, post},
};

use crate::db::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/payments", post(create_payment))
        .route("/payments/webhook", post(handle_payment_webhook))
        .route("/payments/{order_code}", get(get_payment_status))
}
