//! Offline jobs run from the CLI: expiry sweep, reconciliation, email resend,
//! and revocation.
//!
//! None of these run inline with requests. Inconsistencies found here are
//! reported on the operator log target.

use rusqlite::Connection;
use serde::Serialize;

use crate::catalog::PackageCatalog;
use crate::db::{AppState, queries};
use crate::error::Result;
use crate::handlers::payments::deliver_license_email;
use crate::handlers::trials::trial_license;
use crate::models::OrderStatus;
use crate::util::SECONDS_PER_DAY;

/// Usage records younger than this may still be mid-issuance.
pub const ORPHAN_GRACE_SECS: i64 = 600;

#[derive(Debug, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub licenses_expired: usize,
    pub trial_usages_expired: usize,
}

/// Flip everything whose expiry has passed. Revoked rows are never touched.
pub fn sweep(conn: &Connection, now: i64) -> Result<SweepReport> {
    let report = SweepReport {
        licenses_expired: queries::expire_licenses(conn, now)?,
        trial_usages_expired: queries::expire_trial_usages(conn, now)?,
    };
    tracing::info!(
        licenses = report.licenses_expired,
        trial_usages = report.trial_usages_expired,
        "Expiry sweep finished"
    );
    Ok(report)
}

#[derive(Debug, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub orphan_trials_repaired: usize,
    pub orders_completed: usize,
    /// Completed orders with no license; reported, not repaired
    pub completed_without_license: Vec<i64>,
}

/// Find and repair partial writes.
///
/// - A trial usage with no license gets the license it was claimed for.
/// - An order that has a license but is not `completed` is completed.
/// - A `completed` order with no license is only reported.
pub fn reconcile(conn: &Connection, catalog: &PackageCatalog, now: i64) -> Result<ReconcileReport> {
    let mut report = ReconcileReport::default();

    for usage in queries::list_orphan_trial_usages(conn, now - ORPHAN_GRACE_SECS)? {
        let duration_days = ((usage.expires_at - usage.activated_at) / SECONDS_PER_DAY) as i32;
        let input = trial_license(
            catalog,
            usage.trial_license_key.clone(),
            duration_days,
            &usage.machine_fingerprint,
            None,
            usage.expires_at,
        );
        if queries::create_license_if_absent(conn, &input)?.is_none() {
            // A concurrent run repaired it first.
            continue;
        }
        tracing::warn!(
            target: "vtrack_license::operator",
            fingerprint = %usage.machine_fingerprint,
            license_key = %usage.trial_license_key,
            "Repaired trial usage with no license"
        );
        report.orphan_trials_repaired += 1;
    }

    for order in queries::list_uncompleted_orders_with_license(conn)? {
        if queries::transition_order_status(conn, order.order_code, OrderStatus::Completed)? {
            tracing::warn!(
                target: "vtrack_license::operator",
                order_code = order.order_code,
                previous_status = order.status.as_ref(),
                "Completed order that already had a license"
            );
            report.orders_completed += 1;
        }
    }

    for order in queries::list_completed_orders_without_license(conn)? {
        tracing::error!(
            target: "vtrack_license::operator",
            order_code = order.order_code,
            customer_email = %order.customer_email,
            package_code = %order.package_code,
            "Completed order has no license"
        );
        report.completed_without_license.push(order.order_code);
    }

    tracing::info!(
        orphan_trials_repaired = report.orphan_trials_repaired,
        orders_completed = report.orders_completed,
        completed_without_license = report.completed_without_license.len(),
        "Reconciliation finished"
    );
    Ok(report)
}

#[derive(Debug, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResendReport {
    pub attempted: usize,
    pub sent: usize,
}

/// Retry the delivery email for paid licenses that never got one.
pub async fn resend_emails(state: &AppState, limit: i64) -> Result<ResendReport> {
    let pending = {
        let conn = state.db.get()?;
        queries::list_licenses_pending_email(&conn, limit)?
    };

    let mut report = ResendReport::default();
    for license in &pending {
        report.attempted += 1;
        if deliver_license_email(state, license).await {
            report.sent += 1;
        }
    }

    tracing::info!(attempted = report.attempted, sent = report.sent, "Email resend finished");
    Ok(report)
}

/// Administrative `active -> revoked`. Returns false if the license was not
/// active (or does not exist).
pub fn revoke(conn: &Connection, license_key: &str) -> Result<bool> {
    let revoked = queries::revoke_license(conn, license_key)?;
    if revoked {
        tracing::warn!(target: "vtrack_license::operator", license_key, "License revoked");
    }
    Ok(revoked)
}
