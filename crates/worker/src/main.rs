//! Tably Background Worker
//!
//! Handles scheduled billing jobs:
//! - Billing tick: due trial conversions and renewals, past-due retries,
//!   expiry (every minute)
//! - Billing invariant sweep (daily at 5:00 AM UTC)
//! - Processed webhook event cleanup (daily at 3:00 AM UTC)

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use tably_billing::BillingService;
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    #[allow(clippy::expect_used)] // Fail-fast on startup if required config is missing
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Tably Worker");

    let pool = create_db_pool().await?;
    tably_billing::store::postgres::run_migrations(&pool).await?;

    let billing = Arc::new(BillingService::from_env(pool));
    if billing.gateways.is_empty() {
        warn!("no payment gateway configured; boundary charges will be skipped until one is");
    }

    let scheduler = JobScheduler::new().await?;

    // Job 1: Billing tick (every minute)
    // Due boundaries, past-due retries and expiry are all derived from
    // persisted state, so overlapping or missed ticks are safe.
    let tick_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 * * * * *", move |_uuid, _l| {
            let billing = tick_billing.clone();
            Box::pin(async move {
                match billing.scheduler.tick(OffsetDateTime::now_utc()).await {
                    Ok(summary) => {
                        if summary.due_found > 0
                            || summary.retries_attempted > 0
                            || summary.expired > 0
                        {
                            info!(
                                charged = summary.charged,
                                recovered = summary.recovered,
                                moved_past_due = summary.moved_past_due,
                                expired = summary.expired,
                                errors = summary.errors,
                                "billing tick processed due subscriptions"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "billing tick failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Billing tick (every minute)");

    // Job 2: Invariant sweep (daily at 5:00 AM UTC)
    let invariant_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 5 * * *", move |_uuid, _l| {
            let billing = invariant_billing.clone();
            Box::pin(async move {
                info!("Running billing invariant sweep");
                match billing
                    .invariants
                    .run_all_checks(OffsetDateTime::now_utc())
                    .await
                {
                    Ok(summary) if summary.healthy => {
                        info!(checks_run = summary.checks_run, "billing invariants healthy")
                    }
                    Ok(summary) => {
                        for violation in &summary.violations {
                            error!(
                                invariant = violation.invariant,
                                severity = %violation.severity,
                                description = %violation.description,
                                "billing invariant violated"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "invariant sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Billing invariant sweep (daily at 5:00 AM UTC)");

    // Job 3: Cleanup processed webhook events (daily at 3:00 AM UTC)
    let cleanup_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let billing = cleanup_billing.clone();
            Box::pin(async move {
                let cutoff = OffsetDateTime::now_utc() - time::Duration::days(30);
                match billing
                    .store()
                    .events
                    .purge_webhook_events_before(cutoff)
                    .await
                {
                    Ok(purged) => info!(purged = purged, "webhook event cleanup complete"),
                    Err(e) => error!(error = %e, "webhook event cleanup failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Webhook event cleanup (daily at 3:00 AM UTC)");

    // Job 4: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Tably Worker started successfully with 4 scheduled jobs");

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
