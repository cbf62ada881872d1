//! Cuenty Background Worker
//!
//! Handles scheduled jobs including:
//! - Daily renewal check (urgency scan, auto-renewals, reminders, grace
//!   expiry) at the configured `DAILY_RENEWAL_CHECK_TIME`
//! - Daily retention cleanup at the configured `DAILY_LOG_CLEANUP_TIME`
//! - Health check heartbeat (every 5 minutes)
//!
//! All automation behavior is controlled by the feature gate read once at
//! startup; changing a flag requires a restart.

use std::sync::Arc;
use std::time::Duration;

use cuenty_engine::{Engine, PgStore};
use cuenty_shared::AppConfig;
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Create a database connection pool, failing fast when unconfigured
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

    let migration_pool = cuenty_shared::create_migration_pool(&database_url).await?;
    cuenty_shared::run_migrations(&migration_pool).await?;
    migration_pool.close().await;

    let pool = cuenty_shared::create_pool(&database_url).await?;
    info!("Database pool created");
    Ok(pool)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // A bad schedule string or half-configured channel refuses to start the
    // automation loop rather than misbehave at run time.
    let config = AppConfig::from_env()?;

    let default_filter = if config.features.debug_logs { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    info!("Starting Cuenty Worker");
    info!(
        auto_assignment = config.features.auto_assignment,
        auto_renewals = config.features.auto_renewals,
        auto_notifications = config.features.auto_notifications,
        email_copies = config.features.email_copies,
        auto_cleanup = config.features.auto_cleanup,
        "Feature gate loaded"
    );

    let pool = create_db_pool().await?;
    let store = Arc::new(PgStore::new(pool));
    let auto_cleanup = config.features.auto_cleanup;
    let renewal_cron = config.schedules.renewal_check.to_cron();
    let cleanup_cron = config.schedules.log_cleanup.to_cron();
    let renewal_time = config.schedules.renewal_check;
    let cleanup_time = config.schedules.log_cleanup;
    let engine = Arc::new(Engine::from_config(config, store));

    let scheduler = JobScheduler::new().await?;

    // Job 1: Daily renewal check at the configured wall-clock time.
    // try_run skips (and logs) if the previous run is somehow still going.
    let renewal_engine = engine.clone();
    scheduler
        .add(Job::new_async(renewal_cron.as_str(), move |_uuid, _l| {
            let engine = renewal_engine.clone();
            Box::pin(async move {
                let today = OffsetDateTime::now_utc().date();
                info!(run_date = %today, "Running scheduled renewal check");
                match engine.scheduler.try_run(today).await {
                    Ok(Some(summary)) => {
                        info!(
                            scanned = summary.scanned,
                            due_now = summary.census.due_now,
                            renewals_succeeded = summary.renewals_succeeded,
                            renewals_failed = summary.renewals_failed,
                            lapsed = summary.lapsed,
                            reminders_sent = summary.reminders_sent,
                            reminders_deduped = summary.reminders_deduped,
                            expired = summary.expired,
                            "Renewal check complete"
                        );
                    }
                    Ok(None) => {
                        warn!("Renewal check trigger skipped; previous run still in flight");
                    }
                    Err(e) => {
                        error!(error = %e, "Renewal check failed");
                    }
                }
            })
        })?)
        .await?;
    info!(schedule = %renewal_time, "Scheduled: Daily renewal check");

    // Job 2: Daily retention cleanup
    let cleanup_engine = engine.clone();
    scheduler
        .add(Job::new_async(cleanup_cron.as_str(), move |_uuid, _l| {
            let engine = cleanup_engine.clone();
            Box::pin(async move {
                if !auto_cleanup {
                    info!("Cleanup gate disabled; skipping retention purge");
                    return;
                }
                info!("Running retention cleanup");
                match engine.run_cleanup(OffsetDateTime::now_utc()).await {
                    Ok(summary) => {
                        info!(
                            subscriptions_purged = summary.subscriptions_purged,
                            events_purged = summary.events_purged,
                            "Cleanup complete"
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "Cleanup failed");
                    }
                }
            })
        })?)
        .await?;
    info!(schedule = %cleanup_time, "Scheduled: Retention cleanup");

    // Job 3: Health check heartbeat (every 5 minutes)
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

    info!("Cuenty Worker started successfully with 3 scheduled jobs");

    // Keep the main task running; the scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
