use axum::{Router, extract::State, routing::post};
use chrono::Utc;
use rusqlite::{Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};

use crate::catalog::PackageCatalog;
use crate::db::{AppState, queries};
use crate::error::{AppError, Result};
use crate::extractors::{ClientIp, Json};
use crate::models::{AbuseKind, CreateLicense, CreateTrialUsage, License, TrialDenial, TrialPolicy};
use crate::util::{SECONDS_PER_DAY, normalize_email, start_of_utc_day};

const MAX_FINGERPRINT_LEN: usize = 256;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/trials/eligibility", post(check_eligibility))
        .route("/trials", post(request_trial))
}

/// Run the eligibility checks in order; the first failing check wins.
///
/// Returns `None` when the machine may start a trial.
pub fn check_trial_eligibility(
    conn: &Connection,
    policy: &TrialPolicy,
    machine_fingerprint: &str,
    client_ip: &str,
    now: i64,
) -> Result<Option<TrialDenial>> {
    if !policy.enabled {
        return Ok(Some(TrialDenial::Disabled));
    }

    if let Some(usage) = queries::get_trial_usage(conn, machine_fingerprint)? {
        return Ok(Some(TrialDenial::AlreadyUsed {
            activated_at: usage.activated_at,
        }));
    }

    let day_start = start_of_utc_day(now);

    if policy.abuse_detection_enabled {
        let from_ip = queries::count_trial_usages_for_ip_since(conn, client_ip, day_start)?;
        if from_ip >= policy.max_trials_per_ip {
            return Ok(Some(abuse(AbuseKind::AbusePerIp, client_ip, from_ip)));
        }
    }

    let today = queries::count_trial_usages_since(conn, day_start)?;
    if today >= policy.max_trials_per_day {
        return Ok(Some(abuse(AbuseKind::AbuseDailyCap, client_ip, today)));
    }

    Ok(None)
}

fn abuse(kind: AbuseKind, client_ip: &str, count: i64) -> TrialDenial {
    tracing::warn!(
        target: "vtrack_license::operator",
        code = kind.as_ref(),
        client_ip,
        count,
        "Trial request refused by abuse controls"
    );
    TrialDenial::AbuseDetected(kind)
}

/// Everything the caller knows about the machine asking for a trial.
#[derive(Debug, Clone)]
pub struct TrialRequest<'a> {
    pub machine_fingerprint: &'a str,
    pub customer_email: Option<String>,
    pub client_ip: &'a str,
    pub app_version: Option<String>,
    pub device_info: Option<serde_json::Value>,
}

/// Build the trial license that a usage record stands for.
pub fn trial_license(
    catalog: &PackageCatalog,
    license_key: String,
    duration_days: i32,
    machine_fingerprint: &str,
    customer_email: Option<String>,
    expires_at: i64,
) -> CreateLicense {
    CreateLicense {
        license_key,
        customer_email,
        package_code: PackageCatalog::trial_package_code(duration_days),
        display_name: format!("VTrack Trial ({} days)", duration_days),
        features: catalog.trial_features().to_vec(),
        expires_at: Some(expires_at),
        order_code: None,
        amount: None,
        is_trial: true,
        trial_duration_days: Some(duration_days),
        machine_fingerprint: Some(machine_fingerprint.to_string()),
    }
}

/// Issue a trial license, claiming the machine's one trial.
///
/// Eligibility is re-evaluated inside a write transaction, the usage record
/// is claimed with a create-if-absent insert keyed by fingerprint, and the
/// license is written only if that claim succeeded. Concurrent requests for
/// one fingerprint therefore produce exactly one license; the rest are told
/// the trial was already used.
pub fn generate_trial_license(
    conn: &mut Connection,
    catalog: &PackageCatalog,
    license_key_prefix: &str,
    policy: &TrialPolicy,
    request: &TrialRequest<'_>,
    now: i64,
) -> Result<License> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    if let Some(denial) =
        check_trial_eligibility(&tx, policy, request.machine_fingerprint, request.client_ip, now)?
    {
        return Err(AppError::TrialDenied(denial));
    }

    let duration_days = policy.duration_days;
    let expires_at = now + duration_days as i64 * SECONDS_PER_DAY;
    let license_key = queries::generate_license_key(
        license_key_prefix,
        &PackageCatalog::trial_package_code(duration_days),
        now,
    );

    let claimed = queries::try_create_trial_usage(
        &tx,
        &CreateTrialUsage {
            machine_fingerprint: request.machine_fingerprint.to_string(),
            trial_license_key: license_key.clone(),
            activated_at: now,
            expires_at,
            ip_address: request.client_ip.to_string(),
            app_version: request.app_version.clone(),
            device_info: request.device_info.clone(),
        },
    )?;

    if !claimed {
        let activated_at = queries::get_trial_usage(&tx, request.machine_fingerprint)?
            .map(|usage| usage.activated_at)
            .unwrap_or(now);
        return Err(AppError::TrialDenied(TrialDenial::AlreadyUsed { activated_at }));
    }

    let license = queries::create_license(
        &tx,
        &trial_license(
            catalog,
            license_key,
            duration_days,
            request.machine_fingerprint,
            request.customer_email.clone(),
            expires_at,
        ),
    )
    .inspect_err(|e| {
        tracing::error!(
            target: "vtrack_license::operator",
            fingerprint = request.machine_fingerprint,
            error = %e,
            "Trial license write failed after usage claim, rolling back"
        );
    })?;

    tx.commit()?;
    Ok(license)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EligibilityRequest {
    pub machine_fingerprint: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EligibilityResponse {
    pub eligible: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activated_at: Option<i64>,
    /// Length of the trial the machine would get
    pub duration_days: i32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialLicenseRequest {
    pub machine_fingerprint: String,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub app_version: Option<String>,
    #[serde(default)]
    pub device_info: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialLicenseResponse {
    pub trial_license_key: String,
    pub expires_at: i64,
    pub duration_days: i32,
    pub features: Vec<String>,
}

fn validate_fingerprint(fingerprint: &str) -> Result<&str> {
    let trimmed = fingerprint.trim();
    if trimmed.is_empty() || trimmed.len() > MAX_FINGERPRINT_LEN {
        return Err(AppError::BadRequest(format!(
            "machineFingerprint must be 1-{} characters",
            MAX_FINGERPRINT_LEN
        )));
    }
    Ok(trimmed)
}

pub async fn check_eligibility(
    State(state): State<AppState>,
    ClientIp(client_ip): ClientIp,
    Json(request): Json<EligibilityRequest>,
) -> Result<Json<EligibilityResponse>> {
    let fingerprint = validate_fingerprint(&request.machine_fingerprint)?;

    let conn = state.db.get()?;
    let policy = queries::get_trial_policy(&conn)?;
    let denial = check_trial_eligibility(&conn, &policy, fingerprint, &client_ip, Utc::now().timestamp())?;

    Ok(Json(EligibilityResponse {
        eligible: denial.is_none(),
        reason: denial.as_ref().map(TrialDenial::reason),
        message: denial.as_ref().map(TrialDenial::message),
        activated_at: denial.as_ref().and_then(TrialDenial::activated_at),
        duration_days: policy.duration_days,
    }))
}

pub async fn request_trial(
    State(state): State<AppState>,
    ClientIp(client_ip): ClientIp,
    Json(request): Json<TrialLicenseRequest>,
) -> Result<Json<TrialLicenseResponse>> {
    let fingerprint = validate_fingerprint(&request.machine_fingerprint)?;
    let customer_email = request
        .customer_email
        .as_deref()
        .map(normalize_email)
        .filter(|e| !e.is_empty());

    let mut conn = state.db.get()?;
    let policy = queries::get_trial_policy(&conn)?;

    let license = generate_trial_license(
        &mut conn,
        &state.catalog,
        &state.license_key_prefix,
        &policy,
        &TrialRequest {
            machine_fingerprint: fingerprint,
            customer_email,
            client_ip: &client_ip,
            app_version: request.app_version,
            device_info: request.device_info,
        },
        Utc::now().timestamp(),
    )
    .inspect_err(|e| {
        if let AppError::TrialDenied(denial) = e {
            tracing::info!(fingerprint, client_ip = %client_ip, reason = denial.reason(), "Trial denied");
        }
    })?;

    tracing::info!(
        fingerprint,
        client_ip = %client_ip,
        license_key = %license.license_key,
        policy_version = policy.version,
        "Trial license issued"
    );

    Ok(Json(TrialLicenseResponse {
        trial_license_key: license.license_key,
        expires_at: license.expires_at.unwrap_or_default(),
        duration_days: policy.duration_days,
        features: license.features,
    }))
}
