use std::str::FromStr;

use rusqlite::{Connection, OptionalExtension, Row, ToSql, types::Type};

use crate::error::Result;
use crate::models::*;

/// Map a result row (selected with the matching `*_COLS` list) into a model.
pub trait FromRow: Sized {
    fn from_row(row: &Row) -> rusqlite::Result<Self>;
}

pub const ORDER_COLS: &str = "order_code, customer_email, package_code, amount, status, payment_url, payment_link_id, created_at, updated_at";

pub const LICENSE_COLS: &str = "license_key, customer_email, package_code, display_name, features, status, created_at, expires_at, order_code, amount, is_trial, trial_duration_days, machine_fingerprint, email_sent_at";

pub const TRIAL_USAGE_COLS: &str = "machine_fingerprint, trial_license_key, activated_at, expires_at, ip_address, app_version, device_info, status";

pub const TRIAL_POLICY_COLS: &str = "enabled, duration_days, max_trials_per_ip, max_trials_per_day, abuse_detection_enabled, version, updated_at, updated_by";

fn parse_enum<T>(row: &Row, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_json<T: serde::de::DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_json_opt<T: serde::de::DeserializeOwned>(
    row: &Row,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        serde_json::from_str(&s)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

impl FromRow for PaymentOrder {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(PaymentOrder {
            order_code: row.get(0)?,
            customer_email: row.get(1)?,
            package_code: row.get(2)?,
            amount: row.get(3)?,
            status: parse_enum(row, 4)?,
            payment_url: row.get(5)?,
            payment_link_id: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }
}

impl FromRow for License {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(License {
            license_key: row.get(0)?,
            customer_email: row.get(1)?,
            package_code: row.get(2)?,
            display_name: row.get(3)?,
            features: parse_json(row, 4)?,
            status: parse_enum(row, 5)?,
            created_at: row.get(6)?,
            expires_at: row.get(7)?,
            order_code: row.get(8)?,
            amount: row.get(9)?,
            is_trial: row.get::<_, i32>(10)? != 0,
            trial_duration_days: row.get(11)?,
            machine_fingerprint: row.get(12)?,
            email_sent_at: row.get(13)?,
        })
    }
}

impl FromRow for TrialUsage {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(TrialUsage {
            machine_fingerprint: row.get(0)?,
            trial_license_key: row.get(1)?,
            activated_at: row.get(2)?,
            expires_at: row.get(3)?,
            ip_address: row.get(4)?,
            app_version: row.get(5)?,
            device_info: parse_json_opt(row, 6)?,
            status: parse_enum(row, 7)?,
        })
    }
}

impl FromRow for TrialPolicy {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(TrialPolicy {
            enabled: row.get::<_, i32>(0)? != 0,
            duration_days: row.get(1)?,
            max_trials_per_ip: row.get(2)?,
            max_trials_per_day: row.get(3)?,
            abuse_detection_enabled: row.get::<_, i32>(4)? != 0,
            version: row.get(5)?,
            updated_at: row.get(6)?,
            updated_by: row.get(7)?,
        })
    }
}

pub fn query_one<T: FromRow>(conn: &Connection, sql: &str, params: &[&dyn ToSql]) -> Result<Option<T>> {
    conn.query_row(sql, params, T::from_row)
        .optional()
        .map_err(Into::into)
}

pub fn query_all<T: FromRow>(conn: &Connection, sql: &str, params: &[&dyn ToSql]) -> Result<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, T::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}
