//! Refbase Ledger Worker
//!
//! Handles scheduled jobs including:
//! - Hold-period validation of pending commissions (hourly)
//! - Release of validated commissions (hourly, at :30)
//! - Ledger event queue processing (every minute)
//! - Monthly ranking and top-3 multipliers (1st of the month, 00:05 UTC)
//! - Ledger invariant audit (daily at 3:00 AM UTC)
//! - Processed event cleanup (daily at 4:00 AM UTC)

mod event_processor;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use refbase_ledger::clock::previous_month_key;
use refbase_ledger::{BatchResult, LedgerResult, LedgerService};
use refbase_shared::{create_migration_pool, create_pool, init_tracing, run_migrations, InfraConfig};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Pages drained per settlement run before yielding to the next tick
const MAX_PAGES_PER_RUN: usize = 50;

/// Processed events are kept this long for auditing
const EVENT_RETENTION: Duration = Duration::from_secs(30 * 24 * 3600);

/// Run a one-page batch repeatedly until it comes back short
async fn drain<F, Fut>(job: &str, batch_size: i64, mut run_page: F) -> BatchResult
where
    F: FnMut() -> Fut,
    Fut: Future<Output = LedgerResult<BatchResult>>,
{
    let mut total = BatchResult::default();
    for _ in 0..MAX_PAGES_PER_RUN {
        match run_page().await {
            Ok(page) => {
                total.processed += page.processed;
                total.transitioned += page.transitioned;
                total.skipped += page.skipped;
                total.errors += page.errors;
                // A page of pure failures would be re-read forever
                if (page.processed as i64) < batch_size || page.transitioned == 0 {
                    break;
                }
            }
            Err(e) => {
                error!(job, error = %e, "Settlement page failed");
                break;
            }
        }
    }

    info!(
        job,
        processed = total.processed,
        transitioned = total.transitioned,
        skipped = total.skipped,
        errors = total.errors,
        "Settlement run complete"
    );
    total
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    let config = InfraConfig::from_env()?;
    init_tracing(config.log_format);

    info!("Starting Refbase Ledger Worker");

    if config.run_migrations {
        let migration_pool = create_migration_pool(config.migration_url()).await?;
        run_migrations(&migration_pool).await?;
        migration_pool.close().await;
    }

    let pool = create_pool(
        &config.database_url,
        config.database_max_connections,
        config.database_acquire_timeout,
    )
    .await?;

    let ledger = Arc::new(LedgerService::from_pool_with(
        pool.clone(),
        config.ledger_batch_size,
        time::Duration::try_from(config.config_cache_ttl)?,
    ));

    match ledger.config.current().await {
        Ok(current) if !current.is_system_active => {
            warn!(version = current.version, "Commission system is disabled in ledger_config");
        }
        Ok(current) => info!(version = current.version, "Ledger config loaded"),
        Err(e) => warn!(error = %e, "Ledger config unavailable; jobs will retry on each run"),
    }

    // Create scheduler
    let scheduler = JobScheduler::new().await?;
    let batch_size = config.ledger_batch_size;

    // Job 1: Validate pending commissions past the hold period (hourly)
    let validation_service = ledger.commissions.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let service = validation_service.clone();
            Box::pin(async move {
                info!("Running commission validation");
                drain("validate_pending_commissions", batch_size, || {
                    service.validate_pending_commissions()
                })
                .await;
            })
        })?)
        .await?;
    info!("Scheduled: Commission validation (hourly)");

    // Job 2: Release validated commissions past the release delay (hourly, offset)
    let release_service = ledger.commissions.clone();
    scheduler
        .add(Job::new_async("0 30 * * * *", move |_uuid, _l| {
            let service = release_service.clone();
            Box::pin(async move {
                info!("Running commission release");
                drain("release_validated_commissions", batch_size, || {
                    service.release_validated_commissions()
                })
                .await;
            })
        })?)
        .await?;
    info!("Scheduled: Commission release (hourly at :30)");

    // Job 3: Process ledger event queue (every minute)
    let event_pool = pool.clone();
    let dispatcher = ledger.triggers.clone();
    let event_batch_size = config.event_batch_size;
    let event_max_attempts = config.event_max_attempts;
    scheduler
        .add(Job::new_async("0 * * * * *", move |_uuid, _l| {
            let pool = event_pool.clone();
            let dispatcher = dispatcher.clone();
            Box::pin(async move {
                event_processor::process_event_queue(
                    &pool,
                    &dispatcher,
                    event_batch_size,
                    event_max_attempts,
                )
                .await;
            })
        })?)
        .await?;
    info!("Scheduled: Ledger event processing (every minute)");

    // Job 4: Rank the month that just closed (1st of the month, 00:05 UTC)
    let ranking_service = ledger.ranking.clone();
    scheduler
        .add(Job::new_async("0 5 0 1 * *", move |_uuid, _l| {
            let service = ranking_service.clone();
            Box::pin(async move {
                let month = previous_month_key(time::OffsetDateTime::now_utc());
                info!(month = %month, "Running monthly ranking");
                if let Err(e) = service.run_monthly_ranking(&month).await {
                    error!(month = %month, error = %e, "Monthly ranking failed");
                }
            })
        })?)
        .await?;
    info!("Scheduled: Monthly ranking (1st of the month, 00:05 UTC)");

    // Job 5: Ledger invariant audit (daily at 3:00 AM UTC)
    let audit_ledger = ledger.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let ledger = audit_ledger.clone();
            Box::pin(async move {
                info!("Running ledger invariant checks");
                match ledger.invariants.run_all_checks().await {
                    Ok(summary) if !summary.healthy => warn!(
                        checks_failed = summary.checks_failed,
                        violations = summary.violations.len(),
                        "Ledger invariants violated"
                    ),
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Ledger invariant checks failed to run"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Ledger invariant audit (daily at 3:00 AM UTC)");

    // Job 6: Cleanup processed events (daily at 4:00 AM UTC)
    let cleanup_pool = pool.clone();
    scheduler
        .add(Job::new_async("0 0 4 * * *", move |_uuid, _l| {
            let pool = cleanup_pool.clone();
            Box::pin(async move {
                info!("Running ledger event cleanup");
                event_processor::cleanup_processed_events(&pool, EVENT_RETENTION).await;
            })
        })?)
        .await?;
    info!("Scheduled: Ledger event cleanup (daily at 4:00 AM UTC)");

    // Job 7: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Refbase Ledger Worker started successfully with {} scheduled jobs", 7);

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
