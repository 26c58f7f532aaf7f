//! Shared utility functions.

use std::net::IpAddr;

use axum::http::HeaderMap;

pub const SECONDS_PER_DAY: i64 = 86400;

/// Expiry timestamp `days` after `base_time` (None = never expires).
pub fn expires_after_days(days: Option<i32>, base_time: i64) -> Option<i64> {
    days.map(|days| base_time + (days as i64) * SECONDS_PER_DAY)
}

/// Start of the UTC calendar day containing `timestamp`.
pub fn start_of_utc_day(timestamp: i64) -> i64 {
    timestamp - timestamp.rem_euclid(SECONDS_PER_DAY)
}

/// Normalize an email for storage and lookup.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Extract the client IP address.
///
/// Takes the first (client-most) entry of `x-forwarded-for`, then
/// `x-real-ip`, then the socket peer address. "unknown" only when none exist.
pub fn extract_client_ip(headers: &HeaderMap, peer: Option<IpAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let real_ip = || {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    };

    match forwarded.or_else(real_ip) {
        Some(ip) => ip.to_string(),
        None => peer.map_or_else(|| "unknown".to_string(), |ip| ip.to_string()),
    }
}
