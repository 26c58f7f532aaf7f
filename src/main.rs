//! VTrack license server.
//!
//! Usage:
//!   vtrack-license serve
//!   vtrack-license sweep
//!   vtrack-license reconcile
//!   vtrack-license resend-emails --limit 50
//!   vtrack-license revoke VTRACK-P1Y-1734567890-7K2QX9ZA
//!   vtrack-license trial-policy set --enabled false

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use vtrack_license::catalog::PackageCatalog;
use vtrack_license::config::Config;
use vtrack_license::db::{self, AppState, queries};
use vtrack_license::email::ResendMailer;
use vtrack_license::handlers;
use vtrack_license::maintenance;
use vtrack_license::models::UpdateTrialPolicy;
use vtrack_license::payments::{PayOsClient, PaymentGateway, UnconfiguredGateway};
use vtrack_license::retry::RetryPolicy;

#[derive(Parser, Debug)]
#[command(name = "vtrack-license", version)]
#[command(about = "License and trial issuance server for VTrack")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server (default)
    Serve,
    /// Mark licenses and trial usages past their expiry as expired
    Sweep,
    /// Repair partial writes and report inconsistent orders
    Reconcile,
    /// Retry license emails that were never delivered
    ResendEmails {
        #[arg(long, default_value = "100")]
        limit: i64,
    },
    /// Revoke an active license
    Revoke { license_key: String },
    /// Inspect or change the global trial policy
    TrialPolicy {
        #[command(subcommand)]
        action: PolicyAction,
    },
}

#[derive(Subcommand, Debug)]
enum PolicyAction {
    Show,
    Set {
        #[arg(long)]
        enabled: Option<bool>,
        #[arg(long)]
        duration_days: Option<i32>,
        #[arg(long)]
        max_per_ip: Option<i64>,
        #[arg(long)]
        max_per_day: Option<i64>,
        #[arg(long)]
        abuse_detection: Option<bool>,
        /// Recorded as the policy's `updatedBy`
        #[arg(long, default_value = "cli")]
        updated_by: String,
    },
}

fn build_state(config: &Config) -> Result<AppState> {
    let pool = db::create_pool(&config.database_path, config.read_timeout)
        .with_context(|| format!("opening database {}", config.database_path))?;

    let policy = queries::ensure_trial_policy(&*pool.get()?, &config.trial_policy_seed)?;
    tracing::info!(
        enabled = policy.enabled,
        duration_days = policy.duration_days,
        version = policy.version,
        "Trial policy loaded"
    );

    let catalog = match &config.catalog_path {
        Some(path) => PackageCatalog::from_file(path)
            .with_context(|| format!("loading package catalog {}", path))?,
        None => PackageCatalog::builtin(),
    };
    tracing::info!(version = catalog.version(), "Package catalog loaded");

    let gateway: Arc<dyn PaymentGateway> = match &config.payos {
        Some(payos) => {
            if payos.checksum_key.is_none() {
                tracing::warn!("PAYOS_CHECKSUM_KEY not set, webhook signatures will NOT be verified");
            }
            Arc::new(PayOsClient::new(payos, config.write_timeout)?)
        }
        None => {
            tracing::warn!("PayOS not configured, payment creation is disabled");
            Arc::new(UnconfiguredGateway)
        }
    };

    let mailer = ResendMailer::new(
        config.resend_api_key.clone(),
        config.email_from.clone(),
        config.write_timeout,
    )?;

    Ok(AppState {
        db: pool,
        catalog: Arc::new(catalog),
        gateway,
        mailer: Arc::new(mailer),
        base_url: config.base_url.clone(),
        license_key_prefix: config.license_key_prefix.clone(),
        write_timeout: config.write_timeout,
        webhook_timeout: config.webhook_timeout,
        retry: RetryPolicy::default(),
    })
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn serve(config: &Config, state: AppState) -> Result<()> {
    let app = handlers::app(state);
    let listener = tokio::net::TcpListener::bind(config.addr())
        .await
        .with_context(|| format!("binding {}", config.addr()))?;
    tracing::info!("Listening on {} (public URL {})", config.addr(), config.base_url);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("vtrack_license=info,tower_http=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();
    let state = build_state(&config)?;
    let now = Utc::now().timestamp();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(&config, state).await?,
        Command::Sweep => {
            let report = maintenance::sweep(&*state.db.get()?, now)?;
            print_json(&report)?;
        }
        Command::Reconcile => {
            let report = maintenance::reconcile(&*state.db.get()?, &state.catalog, now)?;
            print_json(&report)?;
        }
        Command::ResendEmails { limit } => {
            let report = maintenance::resend_emails(&state, limit).await?;
            print_json(&report)?;
        }
        Command::Revoke { license_key } => {
            if maintenance::revoke(&*state.db.get()?, &license_key)? {
                println!("Revoked {}", license_key);
            } else {
                anyhow::bail!("{} is not an active license", license_key);
            }
        }
        Command::TrialPolicy { action } => {
            let conn = state.db.get()?;
            let policy = match action {
                PolicyAction::Show => queries::get_trial_policy(&conn)?,
                PolicyAction::Set {
                    enabled,
                    duration_days,
                    max_per_ip,
                    max_per_day,
                    abuse_detection,
                    updated_by,
                } => queries::update_trial_policy(
                    &conn,
                    &UpdateTrialPolicy {
                        enabled,
                        duration_days,
                        max_trials_per_ip: max_per_ip,
                        max_trials_per_day: max_per_day,
                        abuse_detection_enabled: abuse_detection,
                    },
                    &updated_by,
                )?,
            };
            print_json(&policy)?;
        }
    }

    Ok(())
}
