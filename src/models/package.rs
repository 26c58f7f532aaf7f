use serde::{Deserialize, Serialize};

/// A purchasable package from the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Package {
    /// Catalog key, e.g. `personal_1y`
    pub code: String,
    /// 3-4 character code embedded in license keys, e.g. `P1Y`
    pub short_code: String,
    pub name: String,
    /// Price in the smallest currency unit
    pub price: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
    /// None = non-expiring license
    #[serde(default)]
    pub duration_days: Option<i32>,
    #[serde(default)]
    pub features: Vec<String>,
}

fn default_currency() -> String {
    "VND".to_string()
}
