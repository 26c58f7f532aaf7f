use serde::{Deserialize, Serialize};
use strum::AsRefStr;

use super::LicenseStatus;

/// Proof that a machine has consumed its trial. One row per fingerprint, ever.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialUsage {
    pub machine_fingerprint: String,
    pub trial_license_key: String,
    pub activated_at: i64,
    pub expires_at: i64,
    pub ip_address: String,
    pub app_version: Option<String>,
    pub device_info: Option<serde_json::Value>,
    pub status: LicenseStatus,
}

#[derive(Debug, Clone)]
pub struct CreateTrialUsage {
    pub machine_fingerprint: String,
    pub trial_license_key: String,
    pub activated_at: i64,
    pub expires_at: i64,
    pub ip_address: String,
    pub app_version: Option<String>,
    pub device_info: Option<serde_json::Value>,
}

/// Global trial configuration. Read once per request and passed by value
/// into eligibility and issuance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialPolicy {
    pub enabled: bool,
    pub duration_days: i32,
    pub max_trials_per_ip: i64,
    pub max_trials_per_day: i64,
    pub abuse_detection_enabled: bool,
    /// Bumped on every administrative update
    pub version: i64,
    pub updated_at: i64,
    pub updated_by: Option<String>,
}

impl Default for TrialPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            duration_days: 7,
            max_trials_per_ip: 3,
            max_trials_per_day: 100,
            abuse_detection_enabled: true,
            version: 0,
            updated_at: 0,
            updated_by: None,
        }
    }
}

/// Administrative policy change. Unset fields keep their current value.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTrialPolicy {
    pub enabled: Option<bool>,
    pub duration_days: Option<i32>,
    pub max_trials_per_ip: Option<i64>,
    pub max_trials_per_day: Option<i64>,
    pub abuse_detection_enabled: Option<bool>,
}

/// Internal code for operators; clients only see `TrialDenial::reason`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum AbuseKind {
    AbusePerIp,
    AbuseDailyCap,
}

/// Why a machine cannot have a trial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrialDenial {
    Disabled,
    AlreadyUsed { activated_at: i64 },
    AbuseDetected(AbuseKind),
}

impl TrialDenial {
    /// Stable client-facing reason code.
    pub fn reason(&self) -> &'static str {
        match self {
            TrialDenial::Disabled => "trial_disabled",
            TrialDenial::AlreadyUsed { .. } => "trial_already_used",
            TrialDenial::AbuseDetected(_) => "abuse_detected",
        }
    }

    pub fn message(&self) -> String {
        match self {
            TrialDenial::Disabled => "Trials are currently unavailable".to_string(),
            TrialDenial::AlreadyUsed { activated_at } => {
                let date = chrono::DateTime::<chrono::Utc>::from_timestamp(*activated_at, 0)
                    .map(|dt| dt.format("%b %d, %Y").to_string())
                    .unwrap_or_else(|| "an earlier date".to_string());
                format!("A trial was already used on this machine ({})", date)
            }
            TrialDenial::AbuseDetected(_) => {
                "Too many trial requests, please try again later".to_string()
            }
        }
    }

    pub fn activated_at(&self) -> Option<i64> {
        match self {
            TrialDenial::AlreadyUsed { activated_at } => Some(*activated_at),
            _ => None,
        }
    }
}
