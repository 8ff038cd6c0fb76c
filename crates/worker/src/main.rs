//! MediaMart Background Worker
//!
//! Scheduled jobs:
//! - Purchased-content expiration sweep (`SWEEP_CRON`, default daily at 03:00 UTC)
//! - Webhook ledger pruning (daily at 04:00 UTC)
//! - Heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use mediamart_billing::{ExpirationScheduler, LedgerStore, PgLedgerStore, SweepReport};
use mediamart_shared::create_pool;
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

const DEFAULT_SWEEP_CRON: &str = "0 0 3 * * *";

/// Successful webhook events older than this are pruned
const WEBHOOK_RETENTION_DAYS: i64 = 30;

fn log_sweep_report(report: &SweepReport) {
    if report.skipped {
        info!("Expiration sweep skipped; previous run still in progress");
        return;
    }

    info!(
        buyers_notified = report.buyers_notified,
        reminders_sent = report.reminders_sent,
        expired = report.expired,
        "Expiration sweep complete"
    );

    if report.deletion_failures > 0 || report.notification_failures > 0 {
        warn!(
            deletion_failures = report.deletion_failures,
            notification_failures = report.notification_failures,
            "Expiration sweep had failures; affected purchases are retried next run"
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting MediaMart Worker v{}", env!("CARGO_PKG_VERSION"));

    let database_url = std::env::var("DATABASE_URL")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .context("DATABASE_URL must be set")?;
    let pool = create_pool(&database_url).await?;
    info!("Database pool created");

    // Only the ledger, notifications and asset store; no payment gateway
    let store: Arc<dyn LedgerStore> = Arc::new(PgLedgerStore::new(pool));
    let expiration = ExpirationScheduler::from_env(store.clone());

    let sweep_cron =
        std::env::var("SWEEP_CRON").unwrap_or_else(|_| DEFAULT_SWEEP_CRON.to_string());

    let scheduler = JobScheduler::new().await?;

    // Job 1: Expiration sweep
    scheduler
        .add(Job::new_async(sweep_cron.as_str(), move |_uuid, _l| {
            let expiration = expiration.clone();
            Box::pin(async move {
                info!("Running expiration sweep");
                match expiration.sweep(OffsetDateTime::now_utc()).await {
                    Ok(report) => log_sweep_report(&report),
                    Err(e) => error!(error = %e, "Expiration sweep failed"),
                }
            })
        })?)
        .await?;
    info!(cron = %sweep_cron, "Scheduled: Expiration sweep");

    // Job 2: Webhook ledger pruning
    scheduler
        .add(Job::new_async("0 0 4 * * *", move |_uuid, _l| {
            let store = store.clone();
            Box::pin(async move {
                let cutoff =
                    OffsetDateTime::now_utc() - time::Duration::days(WEBHOOK_RETENTION_DAYS);
                match store.prune_events(cutoff).await {
                    Ok(pruned) => info!(pruned = pruned, "Pruned old webhook events"),
                    Err(e) => error!(error = %e, "Failed to prune webhook events"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Webhook ledger pruning (daily at 4:00 AM UTC)");

    // Job 3: Heartbeat
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat");
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("MediaMart Worker started successfully with {} scheduled jobs", 3);

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
