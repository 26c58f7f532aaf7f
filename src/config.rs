use std::env;
use std::time::Duration;

use crate::models::TrialPolicy;

#[derive(Debug, Clone)]
pub struct PayOsConfig {
    pub client_id: String,
    pub api_key: String,
    /// Signs outgoing payment requests and verifies webhook payloads
    pub checksum_key: Option<String>,
    pub api_url: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_path: String,
    pub base_url: String,
    /// First segment of every issued license key (e.g. VTRACK-P1Y-...)
    pub license_key_prefix: String,
    /// Optional JSON file replacing the built-in package table
    pub catalog_path: Option<String>,
    pub payos: Option<PayOsConfig>,
    pub resend_api_key: Option<String>,
    pub email_from: String,
    /// Trial policy written on first start; later changes go through `trial-policy set`
    pub trial_policy_seed: TrialPolicy,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub webhook_timeout: Duration,
}

fn env_flag(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|v| v != "false" && v != "0")
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let host = env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port: u16 = env_parse("PORT", 3000);

        let base_url = env::var("BASE_URL")
            .unwrap_or_else(|_| format!("http://{}:{}", host, port));

        let payos = match (env::var("PAYOS_CLIENT_ID"), env::var("PAYOS_API_KEY")) {
            (Ok(client_id), Ok(api_key)) => Some(PayOsConfig {
                client_id,
                api_key,
                checksum_key: env::var("PAYOS_CHECKSUM_KEY").ok(),
                api_url: env::var("PAYOS_API_URL")
                    .unwrap_or_else(|_| "https://api-merchant.payos.vn".to_string()),
            }),
            _ => None,
        };

        let trial_policy_seed = TrialPolicy {
            enabled: env_flag("TRIAL_ENABLED", true),
            duration_days: env_parse("TRIAL_DURATION_DAYS", 7),
            max_trials_per_ip: env_parse("TRIAL_MAX_PER_IP", 3),
            max_trials_per_day: env_parse("TRIAL_MAX_PER_DAY", 100),
            abuse_detection_enabled: env_flag("TRIAL_ABUSE_DETECTION", true),
            ..TrialPolicy::default()
        };

        Self {
            host,
            port,
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "vtrack_license.db".to_string()),
            base_url,
            license_key_prefix: env::var("LICENSE_KEY_PREFIX")
                .unwrap_or_else(|_| "VTRACK".to_string()),
            catalog_path: env::var("CATALOG_PATH").ok(),
            payos,
            resend_api_key: env::var("RESEND_API_KEY").ok(),
            email_from: env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "VTrack <licenses@vtrack.app>".to_string()),
            trial_policy_seed,
            read_timeout: Duration::from_secs(env_parse("READ_TIMEOUT_SECS", 10)),
            write_timeout: Duration::from_secs(env_parse("WRITE_TIMEOUT_SECS", 30)),
            webhook_timeout: Duration::from_secs(env_parse("WEBHOOK_TIMEOUT_SECS", 60)),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
