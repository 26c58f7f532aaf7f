mod from_row;
pub mod queries;

pub use from_row::FromRow;

use std::sync::Arc;
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

use crate::catalog::PackageCatalog;
use crate::email::LicenseMailer;
use crate::error::Result;
use crate::payments::PaymentGateway;
use crate::retry::RetryPolicy;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Shared handler state. Holds no per-request data; every coordination
/// decision goes through the database.
#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub catalog: Arc<PackageCatalog>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub mailer: Arc<dyn LicenseMailer>,
    pub base_url: String,
    pub license_key_prefix: String,
    /// Bound for writes that include an outbound call
    pub write_timeout: Duration,
    /// Bound for the whole webhook path (license generation plus email)
    pub webhook_timeout: Duration,
    /// Backoff for gateway and email calls
    pub retry: RetryPolicy,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS payment_orders (
    order_code INTEGER PRIMARY KEY,
    customer_email TEXT NOT NULL,
    package_code TEXT NOT NULL,
    amount INTEGER NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('pending', 'completed', 'failed')),
    payment_url TEXT,
    payment_link_id TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_payment_orders_status ON payment_orders(status, created_at);

CREATE TABLE IF NOT EXISTS licenses (
    license_key TEXT PRIMARY KEY,
    customer_email TEXT,
    package_code TEXT NOT NULL,
    display_name TEXT NOT NULL,
    features TEXT NOT NULL DEFAULT '[]',
    status TEXT NOT NULL CHECK (status IN ('active', 'expired', 'revoked')),
    created_at INTEGER NOT NULL,
    expires_at INTEGER,
    order_code INTEGER UNIQUE,
    amount INTEGER,
    is_trial INTEGER NOT NULL DEFAULT 0,
    trial_duration_days INTEGER,
    machine_fingerprint TEXT,
    email_sent_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_licenses_email ON licenses(customer_email, created_at);
CREATE INDEX IF NOT EXISTS idx_licenses_expiry ON licenses(status, expires_at);

CREATE TABLE IF NOT EXISTS trial_usages (
    machine_fingerprint TEXT PRIMARY KEY,
    trial_license_key TEXT NOT NULL,
    activated_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    ip_address TEXT NOT NULL,
    app_version TEXT,
    device_info TEXT,
    status TEXT NOT NULL CHECK (status IN ('active', 'expired', 'revoked'))
);
CREATE INDEX IF NOT EXISTS idx_trial_usages_ip ON trial_usages(ip_address, activated_at);
CREATE INDEX IF NOT EXISTS idx_trial_usages_activated ON trial_usages(activated_at);

CREATE TABLE IF NOT EXISTS trial_policy (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    enabled INTEGER NOT NULL,
    duration_days INTEGER NOT NULL,
    max_trials_per_ip INTEGER NOT NULL,
    max_trials_per_day INTEGER NOT NULL,
    abuse_detection_enabled INTEGER NOT NULL,
    version INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    updated_by TEXT
);
";

/// Per-connection setup. WAL plus a busy timeout lets concurrent writers
/// queue on the write lock instead of failing with SQLITE_BUSY.
fn configure_connection(conn: &mut Connection) -> rusqlite::Result<()> {
    conn.busy_timeout(Duration::from_secs(10))?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(())
}

/// Open a pooled database at `path` and make sure the schema exists.
pub fn create_pool(path: &str, connection_timeout: Duration) -> Result<DbPool> {
    let manager = SqliteConnectionManager::file(path).with_init(configure_connection);
    let pool = Pool::builder()
        .max_size(16)
        .connection_timeout(connection_timeout)
        .build(manager)?;
    init_db(&*pool.get()?)?;
    Ok(pool)
}

pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

/// Cheap liveness probe for the health endpoint.
pub fn ping(pool: &DbPool) -> bool {
    pool.get()
        .ok()
        .and_then(|conn| conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)).ok())
        .is_some()
}
