use axum::{
    Router,
    extract::State,
    http::StatusCode,
    routing::get,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::db::{AppState, queries};
use crate::error::Result;
use crate::extractors::{Json, Path, Query};
use crate::models::{License, LicenseStatus};
use crate::util::normalize_email;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/licenses", get(list_licenses))
        .route("/licenses/{license_key}", get(validate_license))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateResponse {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<LicenseStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_trial: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub features: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'static str>,
}

impl ValidateResponse {
    fn not_found() -> Self {
        Self {
            valid: false,
            status: None,
            expires_at: None,
            is_trial: None,
            package_code: None,
            features: None,
            error: Some("not found"),
        }
    }

    /// Validity comes from the clock at query time; the stored status may
    /// still say `active` for a license the sweep has not reached yet.
    fn for_license(license: License, now: i64) -> Self {
        Self {
            valid: license.is_valid_at(now),
            status: Some(license.effective_status(now)),
            expires_at: license.expires_at,
            is_trial: Some(license.is_trial),
            package_code: Some(license.package_code),
            features: Some(license.features),
            error: None,
        }
    }
}

pub async fn validate_license(
    State(state): State<AppState>,
    Path(license_key): Path<String>,
) -> Result<(StatusCode, Json<ValidateResponse>)> {
    let conn = state.db.get()?;

    match queries::get_license_by_key(&conn, &license_key)? {
        Some(license) => Ok((
            StatusCode::OK,
            Json(ValidateResponse::for_license(license, Utc::now().timestamp())),
        )),
        None => Ok((StatusCode::NOT_FOUND, Json(ValidateResponse::not_found()))),
    }
}

#[derive(Debug, Deserialize)]
pub struct ListLicensesQuery {
    pub email: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListLicensesResponse {
    pub licenses: Vec<License>,
    pub total_count: usize,
}

/// All licenses for an email, newest first.
pub async fn list_licenses(
    State(state): State<AppState>,
    Query(query): Query<ListLicensesQuery>,
) -> Result<Json<ListLicensesResponse>> {
    let conn = state.db.get()?;
    let licenses = queries::list_licenses_by_email(&conn, &normalize_email(&query.email))?;

    Ok(Json(ListLicensesResponse {
        total_count: licenses.len(),
        licenses,
    }))
}
