//! OrderDesk Settlement Worker
//!
//! Handles scheduled jobs including:
//! - Payment request expiry sweep (every 15 minutes by default)
//! - Pending-suspension sweep (hourly by default)
//! - Ledger invariant check (daily at 03:30 UTC by default)
//! - Heartbeat (every 5 minutes)
//!
//! Reads lazily apply the same expiry and auto-switch rules, so the sweeps
//! only catch up rows that nobody has read.

use std::sync::Arc;
use std::time::Duration;

use orderdesk_billing::{BillingError, BillingService, InvariantChecker};
use orderdesk_shared::{create_migration_pool, create_pool, Config};
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::{Retry, RetryIf};
use tracing::{error, info, warn};

/// Connect with exponential backoff so the worker survives a database that
/// is still starting up
async fn create_db_pool(config: &Config) -> anyhow::Result<sqlx::PgPool> {
    let strategy = ExponentialBackoff::from_millis(200)
        .max_delay(Duration::from_secs(10))
        .map(jitter)
        .take(6);

    let pool = Retry::spawn(strategy, || async {
        create_pool(&config.database_url, config.database_max_connections)
            .await
            .inspect_err(|e| warn!(error = %e, "Database not reachable yet, retrying"))
    })
    .await?;

    Ok(pool)
}

/// Short backoff for a sweep that hit a lock conflict or a transient database error
fn sweep_backoff() -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(100)
        .max_delay(Duration::from_secs(2))
        .map(jitter)
        .take(3)
}

async fn run_migrations(config: &Config) -> anyhow::Result<()> {
    let pool = create_migration_pool(&config.database_url).await?;
    orderdesk_billing::run_migrations(&pool).await?;
    pool.close().await;
    info!("Migrations applied");
    Ok(())
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

    info!("Starting OrderDesk settlement worker");

    let config = Config::from_env()?;
    run_migrations(&config).await?;
    let pool = create_db_pool(&config).await?;

    let billing = Arc::new(BillingService::from_pool(
        pool.clone(),
        config.payment_request_ttl_hours,
    ));
    let checker = Arc::new(InvariantChecker::from_pool(pool));

    let scheduler = JobScheduler::new().await?;

    // Job 1: Expire PENDING payment requests past their deadline
    let expiry_billing = billing.clone();
    scheduler
        .add(Job::new_async(config.expiry_sweep_cron.as_str(), move |_uuid, _l| {
            let billing = expiry_billing.clone();
            Box::pin(async move {
                let sweep = RetryIf::spawn(
                    sweep_backoff(),
                    || billing.payment_requests.sweep_expired(),
                    |e: &BillingError| e.is_retryable(),
                )
                .await;
                match sweep {
                    Ok(sweep) => info!(
                        expired = sweep.expired,
                        failed = sweep.failed,
                        "Payment request expiry sweep finished"
                    ),
                    Err(e) => error!(error = %e, "Payment request expiry sweep failed"),
                }
            })
        })?)
        .await?;
    info!(cron = %config.expiry_sweep_cron, "Scheduled: Payment request expiry sweep");

    // Job 2: Auto-switch or suspend merchants whose access has lapsed
    let suspension_billing = billing.clone();
    scheduler
        .add(Job::new_async(config.suspension_sweep_cron.as_str(), move |_uuid, _l| {
            let billing = suspension_billing.clone();
            Box::pin(async move {
                let sweep = RetryIf::spawn(
                    sweep_backoff(),
                    || billing.subscriptions.apply_pending_suspensions(),
                    |e: &BillingError| e.is_retryable(),
                )
                .await;
                match sweep {
                    Ok(sweep) => {
                        for merchant_id in &sweep.failed {
                            warn!(merchant_id = %merchant_id, "Suspension left for next sweep");
                        }
                    }
                    Err(e) => error!(error = %e, "Suspension sweep failed"),
                }
            })
        })?)
        .await?;
    info!(cron = %config.suspension_sweep_cron, "Scheduled: Pending-suspension sweep");

    // Job 3: Ledger invariants
    let invariant_checker = checker.clone();
    scheduler
        .add(Job::new_async(config.invariant_check_cron.as_str(), move |_uuid, _l| {
            let checker = invariant_checker.clone();
            Box::pin(async move {
                match checker.run_all().await {
                    Ok(report) if report.is_healthy() => {
                        info!(checks_run = report.checks_run, "Ledger invariants hold")
                    }
                    Ok(report) => {
                        for violation in &report.violations {
                            error!(
                                invariant = %violation.invariant,
                                severity = %violation.severity,
                                merchant_id = %violation.merchant_id,
                                description = %violation.description,
                                "Ledger invariant violated"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Invariant check failed to run"),
                }
            })
        })?)
        .await?;
    info!(cron = %config.invariant_check_cron, "Scheduled: Ledger invariant check");

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
    info!("Settlement worker started with 4 scheduled jobs");

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
