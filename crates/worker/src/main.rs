//! Verimark Background Worker
//!
//! Runs the scheduled jobs behind the payment engine:
//! - Grace-period / retry / recurring-billing sweep (every 15 minutes by default)
//! - Heartbeat (every 5 minutes)
//! - Invariant checks over the lifecycle tables (daily at 2:00 UTC)

mod sweep;

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use verimark_payments::PaymentsEngine;

const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 900;

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    let database_url =
        std::env::var("DATABASE_URL").map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

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

    info!("Starting Verimark Worker");

    let pool = create_db_pool().await?;

    // Create the payment engine
    let engine = match PaymentsEngine::from_env(pool.clone()) {
        Ok(e) => Arc::new(e),
        Err(e) => {
            // If the provider isn't configured, run in minimal mode
            warn!(error = %e, "Failed to create payment engine - running in minimal mode");

            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };

    let sweep_interval = std::env::var("SCHEDULER_INTERVAL_SECONDS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS);

    let scheduler = JobScheduler::new().await?;

    // Job 1: the lifecycle sweep (grace expiry, retry ladder, recurring billing)
    let sweep_engine = engine.clone();
    let sweep_pool = pool.clone();
    scheduler
        .add(Job::new_repeated_async(
            Duration::from_secs(sweep_interval),
            move |_uuid, _l| {
                let engine = sweep_engine.clone();
                let pool = sweep_pool.clone();
                Box::pin(async move {
                    info!("Running lifecycle sweep");
                    sweep::run_sweep(&engine, &pool).await;
                })
            },
        )?)
        .await?;
    info!(
        interval_seconds = sweep_interval,
        "Scheduled: lifecycle sweep"
    );

    // Job 2: heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: heartbeat (every 5 minutes)");

    // Job 3: invariant checks (daily at 2:00 UTC)
    let invariant_engine = engine.clone();
    scheduler
        .add(Job::new_async("0 0 2 * * *", move |_uuid, _l| {
            let engine = invariant_engine.clone();
            Box::pin(async move {
                info!("Running payment invariant checks");
                match engine.invariants.run_all_checks().await {
                    Ok(summary) => {
                        if summary.healthy {
                            info!(
                                checks_run = summary.checks_run,
                                "Invariant checks passed"
                            );
                        } else {
                            for violation in &summary.violations {
                                error!(
                                    invariant = %violation.invariant,
                                    severity = %violation.severity,
                                    description = %violation.description,
                                    "Invariant violation"
                                );
                            }
                        }
                    }
                    Err(e) => error!(error = %e, "Invariant check run failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: invariant checks (daily at 2:00 UTC)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Verimark Worker started successfully with 3 scheduled jobs");

    // Keep the main task running; the scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
