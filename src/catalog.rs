//! Package catalog: read-only mapping from package code to price, duration
//! and feature set.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{AppError, Result};
use crate::models::Package;

const BUILTIN_VERSION: &str = "2024-11";

const PERSONAL_FEATURES: &[&str] = &["video_processing", "qr_detection", "export_csv"];
const BUSINESS_FEATURES: &[&str] = &[
    "video_processing",
    "qr_detection",
    "hand_detection",
    "cloud_sources",
    "export_csv",
    "batch_processing",
];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CatalogFile {
    version: String,
    packages: Vec<Package>,
    /// Falls back to the built-in trial features when omitted
    trial_features: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct PackageCatalog {
    version: String,
    packages: HashMap<String, Package>,
    trial_features: Vec<String>,
}

fn features(list: &[&str]) -> Vec<String> {
    list.iter().map(|f| f.to_string()).collect()
}

fn package(code: &str, short_code: &str, name: &str, price: i64, days: Option<i32>, f: &[&str]) -> Package {
    Package {
        code: code.to_string(),
        short_code: short_code.to_string(),
        name: name.to_string(),
        price,
        currency: "VND".to_string(),
        duration_days: days,
        features: features(f),
    }
}

impl PackageCatalog {
    pub fn builtin() -> Self {
        let packages = vec![
            package("personal_1m", "P1M", "VTrack Personal (1 month)", 99_000, Some(30), PERSONAL_FEATURES),
            package("personal_1y", "P1Y", "VTrack Personal (1 year)", 990_000, Some(365), PERSONAL_FEATURES),
            package("personal_lifetime", "PLT", "VTrack Personal (lifetime)", 2_490_000, None, PERSONAL_FEATURES),
            package("business_1y", "B1Y", "VTrack Business (1 year)", 2_990_000, Some(365), BUSINESS_FEATURES),
            package("business_lifetime", "BLT", "VTrack Business (lifetime)", 6_990_000, None, BUSINESS_FEATURES),
        ];
        Self {
            version: BUILTIN_VERSION.to_string(),
            packages: packages.into_iter().map(|p| (p.code.clone(), p)).collect(),
            trial_features: features(PERSONAL_FEATURES),
        }
    }

    pub fn new(version: &str, packages: Vec<Package>, trial_features: Vec<String>) -> Result<Self> {
        let mut by_code = HashMap::with_capacity(packages.len());
        for package in packages {
            if !is_valid_short_code(&package.short_code) {
                return Err(AppError::BadRequest(format!(
                    "Package {} has invalid short code {:?} (expected 3-4 uppercase alphanumerics)",
                    package.code, package.short_code
                )));
            }
            if package.price <= 0 {
                return Err(AppError::BadRequest(format!(
                    "Package {} must have a positive price",
                    package.code
                )));
            }
            if by_code.insert(package.code.clone(), package).is_some() {
                return Err(AppError::BadRequest("Duplicate package code in catalog".into()));
            }
        }
        Ok(Self {
            version: version.to_string(),
            packages: by_code,
            trial_features,
        })
    }

    /// Load a catalog from a JSON file of the form
    /// `{"version": "...", "packages": [...], "trialFeatures": [...]}`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| AppError::Internal(format!("Failed to read catalog: {}", e)))?;
        let file: CatalogFile = serde_json::from_str(&raw)?;
        let trial_features = file
            .trial_features
            .unwrap_or_else(|| features(PERSONAL_FEATURES));
        Self::new(&file.version, file.packages, trial_features)
    }

    pub fn get(&self, code: &str) -> Option<&Package> {
        self.packages.get(code)
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn trial_features(&self) -> &[String] {
        &self.trial_features
    }

    /// Package code used for trial licenses, e.g. `T7D`.
    pub fn trial_package_code(duration_days: i32) -> String {
        format!("T{}D", duration_days)
    }
}

fn is_valid_short_code(code: &str) -> bool {
    (3..=4).contains(&code.len())
        && code
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
}
