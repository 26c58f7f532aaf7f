use chrono::Utc;
use rand::Rng;
use rusqlite::{Connection, params, types::Value};

use crate::error::{AppError, Result};
use crate::models::*;

use super::from_row::{
    LICENSE_COLS, ORDER_COLS, TRIAL_POLICY_COLS, TRIAL_USAGE_COLS, query_all, query_one,
};

fn now() -> i64 {
    Utc::now().timestamp()
}

/// Builder for dynamic UPDATE statements with optional fields.
/// Combines multiple field updates into a single query.
struct UpdateBuilder {
    table: &'static str,
    key_column: &'static str,
    key: Value,
    fields: Vec<(&'static str, Value)>,
    bump_version: bool,
}

impl UpdateBuilder {
    fn new(table: &'static str, key_column: &'static str, key: impl Into<Value>) -> Self {
        Self {
            table,
            key_column,
            key: key.into(),
            fields: Vec::new(),
            bump_version: false,
        }
    }

    fn with_version_bump(mut self) -> Self {
        self.bump_version = true;
        self
    }

    fn set(mut self, column: &'static str, value: impl Into<Value>) -> Self {
        self.fields.push((column, value.into()));
        self
    }

    fn set_opt<V: Into<Value>>(self, column: &'static str, value: Option<V>) -> Self {
        match value {
            Some(v) => self.set(column, v),
            None => self,
        }
    }

    fn execute(self, conn: &Connection) -> Result<bool> {
        if self.fields.is_empty() {
            return Ok(false);
        }
        let mut sets: Vec<String> = self
            .fields
            .iter()
            .map(|(col, _)| format!("{} = ?", col))
            .collect();
        if self.bump_version {
            sets.push("version = version + 1".to_string());
        }
        let mut values: Vec<Value> = self.fields.into_iter().map(|(_, v)| v).collect();
        values.push(self.key);
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?",
            self.table,
            sets.join(", "),
            self.key_column
        );
        let affected = conn.execute(&sql, rusqlite::params_from_iter(values))?;
        Ok(affected > 0)
    }
}

// ============ Payment Orders ============

/// Largest integer a JSON client can represent exactly (2^53 - 1).
const MAX_ORDER_CODE: i64 = 9_007_199_254_740_991;
const ORDER_CODE_ATTEMPTS: usize = 5;

pub fn generate_order_code() -> i64 {
    rand::thread_rng().gen_range(1..=MAX_ORDER_CODE)
}

/// Open a new pending order under a fresh, unused order code.
///
/// The code is claimed with a create-if-absent insert; a collision simply
/// draws another code.
pub fn create_payment_order(conn: &Connection, input: &CreatePaymentOrder) -> Result<PaymentOrder> {
    let now = now();

    for _ in 0..ORDER_CODE_ATTEMPTS {
        let order_code = generate_order_code();
        let inserted = conn.execute(
            "INSERT INTO payment_orders (order_code, customer_email, package_code, amount, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?5)
             ON CONFLICT(order_code) DO NOTHING",
            params![order_code, &input.customer_email, &input.package_code, input.amount, now],
        )?;
        if inserted == 1 {
            return Ok(PaymentOrder {
                order_code,
                customer_email: input.customer_email.clone(),
                package_code: input.package_code.clone(),
                amount: input.amount,
                status: OrderStatus::Pending,
                payment_url: None,
                payment_link_id: None,
                created_at: now,
                updated_at: now,
            });
        }
        tracing::warn!(order_code, "Order code collision, drawing another");
    }

    Err(AppError::Inconsistent(format!(
        "Could not allocate a unique order code after {} attempts",
        ORDER_CODE_ATTEMPTS
    )))
}

pub fn get_payment_order(conn: &Connection, order_code: i64) -> Result<Option<PaymentOrder>> {
    query_one(
        conn,
        &format!("SELECT {} FROM payment_orders WHERE order_code = ?1", ORDER_COLS),
        &[&order_code],
    )
}

/// Store gateway correlation metadata once the payment link exists.
pub fn set_order_payment_link(
    conn: &Connection,
    order_code: i64,
    payment_url: &str,
    payment_link_id: Option<&str>,
) -> Result<bool> {
    UpdateBuilder::new("payment_orders", "order_code", order_code)
        .set("payment_url", payment_url.to_string())
        .set_opt("payment_link_id", payment_link_id.map(String::from))
        .set("updated_at", now())
        .execute(conn)
}

/// Move an order to `next` if its current status allows it.
///
/// The allowed source statuses are part of the WHERE clause, so concurrent
/// callers cannot push an order backwards. Returns whether a row changed.
pub fn transition_order_status(conn: &Connection, order_code: i64, next: OrderStatus) -> Result<bool> {
    let sources: Vec<String> = [OrderStatus::Pending, OrderStatus::Completed, OrderStatus::Failed]
        .into_iter()
        .filter(|from| from.can_transition_to(next))
        .map(|from| format!("'{}'", from.as_ref()))
        .collect();

    if sources.is_empty() {
        return Ok(false);
    }

    let affected = conn.execute(
        &format!(
            "UPDATE payment_orders SET status = ?1, updated_at = ?2 WHERE order_code = ?3 AND status IN ({})",
            sources.join(", ")
        ),
        params![next.as_ref(), now(), order_code],
    )?;
    Ok(affected > 0)
}

/// Orders that have a license but never reached `completed`.
pub fn list_uncompleted_orders_with_license(conn: &Connection) -> Result<Vec<PaymentOrder>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM payment_orders o
             WHERE o.status != 'completed'
               AND EXISTS (SELECT 1 FROM licenses l WHERE l.order_code = o.order_code)
             ORDER BY o.created_at",
            ORDER_COLS
        ),
        &[],
    )
}

/// Completed orders with no license. Should never exist.
pub fn list_completed_orders_without_license(conn: &Connection) -> Result<Vec<PaymentOrder>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM payment_orders o
             WHERE o.status = 'completed'
               AND NOT EXISTS (SELECT 1 FROM licenses l WHERE l.order_code = o.order_code)
             ORDER BY o.created_at",
            ORDER_COLS
        ),
        &[],
    )
}

// ============ Licenses ============

const KEY_SUFFIX_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const KEY_SUFFIX_LEN: usize = 8;

/// Generate a license key in PREFIX-PKG-TIMESTAMP-RANDOM format,
/// e.g. `VTRACK-P1Y-1734567890-7K2QX9ZA`.
pub fn generate_license_key(prefix: &str, package_short_code: &str, issued_at: i64) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..KEY_SUFFIX_LEN)
        .map(|_| KEY_SUFFIX_CHARS[rng.gen_range(0..KEY_SUFFIX_CHARS.len())] as char)
        .collect();
    format!("{}-{}-{}-{}", prefix, package_short_code, issued_at, suffix)
}

fn insert_license_sql(on_conflict: &str) -> String {
    format!(
        "INSERT INTO licenses (license_key, customer_email, package_code, display_name, features, status, created_at, expires_at, order_code, amount, is_trial, trial_duration_days, machine_fingerprint)
         VALUES (?1, ?2, ?3, ?4, ?5, 'active', ?6, ?7, ?8, ?9, ?10, ?11, ?12) {}",
        on_conflict
    )
}

fn insert_license(conn: &Connection, input: &CreateLicense, on_conflict: &str) -> Result<Option<License>> {
    let now = now();
    let features = serde_json::to_string(&input.features)?;

    let inserted = conn.execute(
        &insert_license_sql(on_conflict),
        params![
            &input.license_key,
            &input.customer_email,
            &input.package_code,
            &input.display_name,
            features,
            now,
            input.expires_at,
            input.order_code,
            input.amount,
            input.is_trial as i32,
            input.trial_duration_days,
            &input.machine_fingerprint,
        ],
    )?;

    if inserted == 0 {
        return Ok(None);
    }

    Ok(Some(License {
        license_key: input.license_key.clone(),
        customer_email: input.customer_email.clone(),
        package_code: input.package_code.clone(),
        display_name: input.display_name.clone(),
        features: input.features.clone(),
        status: LicenseStatus::Active,
        created_at: now,
        expires_at: input.expires_at,
        order_code: input.order_code,
        amount: input.amount,
        is_trial: input.is_trial,
        trial_duration_days: input.trial_duration_days,
        machine_fingerprint: input.machine_fingerprint.clone(),
        email_sent_at: None,
    }))
}

/// Create the license for a paid order, unless one already exists for it.
///
/// `order_code` is UNIQUE, so of any number of concurrent callers exactly one
/// gets `Some`; the rest get `None` and must read the winner's license.
pub fn create_license_for_order(conn: &Connection, input: &CreateLicense) -> Result<Option<License>> {
    if input.order_code.is_none() {
        return Err(AppError::Internal("Paid license requires an order code".into()));
    }
    insert_license(conn, input, "ON CONFLICT(order_code) DO NOTHING")
}

/// Create a license with no order (trials and reconciliation repairs).
pub fn create_license(conn: &Connection, input: &CreateLicense) -> Result<License> {
    insert_license(conn, input, "")?
        .ok_or_else(|| AppError::Internal("License insert affected no rows".into()))
}

/// Create a license unless one with the same key already exists.
pub fn create_license_if_absent(conn: &Connection, input: &CreateLicense) -> Result<Option<License>> {
    insert_license(conn, input, "ON CONFLICT(license_key) DO NOTHING")
}

pub fn get_license_by_key(conn: &Connection, license_key: &str) -> Result<Option<License>> {
    query_one(
        conn,
        &format!("SELECT {} FROM licenses WHERE license_key = ?1", LICENSE_COLS),
        &[&license_key],
    )
}

pub fn get_license_by_order_code(conn: &Connection, order_code: i64) -> Result<Option<License>> {
    query_one(
        conn,
        &format!("SELECT {} FROM licenses WHERE order_code = ?1", LICENSE_COLS),
        &[&order_code],
    )
}

pub fn count_licenses_for_order(conn: &Connection, order_code: i64) -> Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM licenses WHERE order_code = ?1",
        params![order_code],
        |row| row.get(0),
    )
    .map_err(Into::into)
}

/// All licenses for an email, newest first. Includes expired and revoked.
pub fn list_licenses_by_email(conn: &Connection, email: &str) -> Result<Vec<License>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM licenses WHERE customer_email = ?1 ORDER BY created_at DESC, rowid DESC",
            LICENSE_COLS
        ),
        &[&email],
    )
}

pub fn mark_license_email_sent(conn: &Connection, license_key: &str) -> Result<()> {
    conn.execute(
        "UPDATE licenses SET email_sent_at = ?1 WHERE license_key = ?2",
        params![now(), license_key],
    )?;
    Ok(())
}

/// Paid licenses whose delivery email has not gone out yet.
pub fn list_licenses_pending_email(conn: &Connection, limit: i64) -> Result<Vec<License>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM licenses
             WHERE is_trial = 0 AND email_sent_at IS NULL AND customer_email IS NOT NULL AND status = 'active'
             ORDER BY created_at LIMIT ?1",
            LICENSE_COLS
        ),
        &[&limit],
    )
}

/// Administrative revocation. Only an active license can be revoked; the
/// backing trial usage (if any) follows it.
pub fn revoke_license(conn: &Connection, license_key: &str) -> Result<bool> {
    let affected = conn.execute(
        "UPDATE licenses SET status = 'revoked' WHERE license_key = ?1 AND status = 'active'",
        params![license_key],
    )?;
    if affected > 0 {
        conn.execute(
            "UPDATE trial_usages SET status = 'revoked' WHERE trial_license_key = ?1 AND status = 'active'",
            params![license_key],
        )?;
    }
    Ok(affected > 0)
}

/// Flip active licenses whose expiry has passed. Returns the number swept.
pub fn expire_licenses(conn: &Connection, now: i64) -> Result<usize> {
    let affected = conn.execute(
        "UPDATE licenses SET status = 'expired'
         WHERE status = 'active' AND expires_at IS NOT NULL AND expires_at <= ?1",
        params![now],
    )?;
    Ok(affected)
}

// ============ Trial Usages ============

pub fn get_trial_usage(conn: &Connection, machine_fingerprint: &str) -> Result<Option<TrialUsage>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM trial_usages WHERE machine_fingerprint = ?1",
            TRIAL_USAGE_COLS
        ),
        &[&machine_fingerprint],
    )
}

/// Claim the trial for a machine. Write-once: returns `false` (and changes
/// nothing) if the fingerprint already has a usage record.
pub fn try_create_trial_usage(conn: &Connection, input: &CreateTrialUsage) -> Result<bool> {
    let device_info = input
        .device_info
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    let inserted = conn.execute(
        "INSERT INTO trial_usages (machine_fingerprint, trial_license_key, activated_at, expires_at, ip_address, app_version, device_info, status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'active')
         ON CONFLICT(machine_fingerprint) DO NOTHING",
        params![
            &input.machine_fingerprint,
            &input.trial_license_key,
            input.activated_at,
            input.expires_at,
            &input.ip_address,
            &input.app_version,
            device_info,
        ],
    )?;
    Ok(inserted == 1)
}

pub fn count_trial_usages_for_ip_since(conn: &Connection, ip_address: &str, since: i64) -> Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM trial_usages WHERE ip_address = ?1 AND activated_at >= ?2",
        params![ip_address, since],
        |row| row.get(0),
    )
    .map_err(Into::into)
}

pub fn count_trial_usages_since(conn: &Connection, since: i64) -> Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM trial_usages WHERE activated_at >= ?1",
        params![since],
        |row| row.get(0),
    )
    .map_err(Into::into)
}

pub fn expire_trial_usages(conn: &Connection, now: i64) -> Result<usize> {
    let affected = conn.execute(
        "UPDATE trial_usages SET status = 'expired' WHERE status = 'active' AND expires_at <= ?1",
        params![now],
    )?;
    Ok(affected)
}

/// Usage records older than `activated_before` whose trial license was never written.
pub fn list_orphan_trial_usages(conn: &Connection, activated_before: i64) -> Result<Vec<TrialUsage>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM trial_usages u
             WHERE u.activated_at < ?1
               AND NOT EXISTS (SELECT 1 FROM licenses l WHERE l.license_key = u.trial_license_key)
             ORDER BY u.activated_at",
            TRIAL_USAGE_COLS
        ),
        &[&activated_before],
    )
}

// ============ Trial Policy ============

fn validate_policy_limits(
    duration_days: Option<i32>,
    max_trials_per_ip: Option<i64>,
    max_trials_per_day: Option<i64>,
) -> Result<()> {
    if let Some(days) = duration_days
        && days <= 0
    {
        return Err(AppError::BadRequest("Trial duration must be at least one day".into()));
    }
    if max_trials_per_ip.is_some_and(|n| n < 0) || max_trials_per_day.is_some_and(|n| n < 0) {
        return Err(AppError::BadRequest("Trial limits cannot be negative".into()));
    }
    Ok(())
}

/// Write the policy row if it does not exist yet, then return the stored policy.
/// The seed is validated like any update, even when a row already exists.
pub fn ensure_trial_policy(conn: &Connection, seed: &TrialPolicy) -> Result<TrialPolicy> {
    validate_policy_limits(
        Some(seed.duration_days),
        Some(seed.max_trials_per_ip),
        Some(seed.max_trials_per_day),
    )?;
    conn.execute(
        "INSERT INTO trial_policy (id, enabled, duration_days, max_trials_per_ip, max_trials_per_day, abuse_detection_enabled, version, updated_at, updated_by)
         VALUES (1, ?1, ?2, ?3, ?4, ?5, 1, ?6, 'seed')
         ON CONFLICT(id) DO NOTHING",
        params![
            seed.enabled as i32,
            seed.duration_days,
            seed.max_trials_per_ip,
            seed.max_trials_per_day,
            seed.abuse_detection_enabled as i32,
            now(),
        ],
    )?;
    get_trial_policy(conn)
}

pub fn get_trial_policy(conn: &Connection) -> Result<TrialPolicy> {
    query_one(
        conn,
        &format!("SELECT {} FROM trial_policy WHERE id = 1", TRIAL_POLICY_COLS),
        &[],
    )?
    .ok_or_else(|| AppError::Internal("Trial policy has not been initialized".into()))
}

pub fn update_trial_policy(
    conn: &Connection,
    input: &UpdateTrialPolicy,
    updated_by: &str,
) -> Result<TrialPolicy> {
    validate_policy_limits(
        input.duration_days,
        input.max_trials_per_ip,
        input.max_trials_per_day,
    )?;

    let changed = UpdateBuilder::new("trial_policy", "id", 1)
        .with_version_bump()
        .set_opt("enabled", input.enabled.map(|b| b as i32))
        .set_opt("duration_days", input.duration_days)
        .set_opt("max_trials_per_ip", input.max_trials_per_ip)
        .set_opt("max_trials_per_day", input.max_trials_per_day)
        .set_opt("abuse_detection_enabled", input.abuse_detection_enabled.map(|b| b as i32))
        .set("updated_at", now())
        .set("updated_by", updated_by.to_string())
        .execute(conn)?;

    if !changed {
        return Err(AppError::Internal("Trial policy has not been initialized".into()));
    }
    get_trial_policy(conn)
}
