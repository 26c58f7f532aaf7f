pub mod licenses;
pub mod payments;
pub mod trials;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    routing::get,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::db::{self, AppState};
use crate::extractors::Json;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    status: &'static str,
    dependencies_ok: bool,
    version: &'static str,
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let dependencies_ok = db::ping(&state.db);
    let (code, status) = if dependencies_ok {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };
    (
        code,
        Json(HealthResponse {
            status,
            dependencies_ok,
            version: env!("CARGO_PKG_VERSION"),
        }),
    )
}

/// The full HTTP surface. Every route is CORS-enabled.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(payments::router())
        .merge(licenses::router())
        .merge(trials::router())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
