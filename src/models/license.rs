use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LicenseStatus {
    Active,
    Expired,
    Revoked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct License {
    pub license_key: String,
    /// Absent only for trials requested without an email
    pub customer_email: Option<String>,
    pub package_code: String,
    pub display_name: String,
    pub features: Vec<String>,
    /// Stored status. Expiry is swept lazily, so use `is_valid_at` for checks.
    pub status: LicenseStatus,
    pub created_at: i64,
    /// None = non-expiring package
    pub expires_at: Option<i64>,
    pub order_code: Option<i64>,
    pub amount: Option<i64>,
    pub is_trial: bool,
    pub trial_duration_days: Option<i32>,
    pub machine_fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_sent_at: Option<i64>,
}

impl License {
    /// Validity is computed from the clock, never from the stored status alone.
    pub fn is_valid_at(&self, now: i64) -> bool {
        self.status == LicenseStatus::Active && self.expires_at.is_none_or(|exp| exp > now)
    }

    /// Stored status with time-based expiry applied.
    pub fn effective_status(&self, now: i64) -> LicenseStatus {
        match self.status {
            LicenseStatus::Active if !self.is_valid_at(now) => LicenseStatus::Expired,
            status => status,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateLicense {
    pub license_key: String,
    pub customer_email: Option<String>,
    pub package_code: String,
    pub display_name: String,
    pub features: Vec<String>,
    pub expires_at: Option<i64>,
    pub order_code: Option<i64>,
    pub amount: Option<i64>,
    pub is_trial: bool,
    pub trial_duration_days: Option<i32>,
    pub machine_fingerprint: Option<String>,
}
