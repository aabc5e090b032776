//! Ledger event queue processing
//!
//! Drains `ledger_events` in batches. Rows are claimed with
//! `FOR UPDATE SKIP LOCKED` and leased by pushing `next_attempt_at` forward,
//! so overlapping runs or several workers never dispatch the same event at
//! the same time. Ledger operations are idempotent per source, which makes a
//! redelivery after a crash harmless.

use std::time::Duration;

use refbase_ledger::{LedgerEvent, TriggerDispatcher, TriggerOutcome};
use sqlx::PgPool;
use tracing::{error, info, warn};
use uuid::Uuid;

/// How long a claimed event stays invisible to other pollers
const CLAIM_LEASE_SECS: i64 = 300;

/// Upper bound on retry backoff
const MAX_BACKOFF_SECS: i64 = 3600;

#[derive(Debug, sqlx::FromRow)]
struct QueuedEvent {
    id: Uuid,
    event_type: String,
    payload: serde_json::Value,
    attempts: i32,
}

/// What happens to a row after one delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
enum Disposition {
    Processed,
    Retry { delay_secs: i64, error: String },
    Failed { error: String },
}

#[derive(Debug, Default, Clone, Copy)]
pub struct QueueRunSummary {
    pub claimed: usize,
    pub processed: usize,
    pub retried: usize,
    pub failed: usize,
}

/// Exponential backoff: 30s, 60s, 120s, ... capped at an hour
fn backoff_secs(attempts: i32) -> i64 {
    let exponent = u32::try_from(attempts.saturating_sub(1)).unwrap_or(0).min(16);
    (30_i64 << exponent).min(MAX_BACKOFF_SECS)
}

fn disposition(outcome: &TriggerOutcome, attempts: i32, max_attempts: i32) -> Disposition {
    match outcome {
        TriggerOutcome::Applied { .. } | TriggerOutcome::Skipped { .. } => Disposition::Processed,
        TriggerOutcome::Failed { error, retryable } if *retryable && attempts < max_attempts => {
            Disposition::Retry {
                delay_secs: backoff_secs(attempts),
                error: error.clone(),
            }
        }
        TriggerOutcome::Failed { error, .. } => Disposition::Failed {
            error: error.clone(),
        },
    }
}

/// Claim due events and bump their attempt counter
async fn claim_events(pool: &PgPool, limit: i64) -> Result<Vec<QueuedEvent>, sqlx::Error> {
    sqlx::query_as::<_, QueuedEvent>(
        r#"
        UPDATE ledger_events
        SET attempts = attempts + 1,
            next_attempt_at = NOW() + make_interval(secs => $2)
        WHERE id IN (
            SELECT id
            FROM ledger_events
            WHERE status = 'queued'
              AND next_attempt_at <= NOW()
            ORDER BY created_at ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
        )
        RETURNING id, event_type, payload, attempts
        "#,
    )
    .bind(limit)
    .bind(CLAIM_LEASE_SECS as f64)
    .fetch_all(pool)
    .await
}

async fn record(pool: &PgPool, id: Uuid, disposition: &Disposition) -> Result<(), sqlx::Error> {
    match disposition {
        Disposition::Processed => {
            sqlx::query(
                r#"
                UPDATE ledger_events
                SET status = 'processed', processed_at = NOW(), last_error = NULL
                WHERE id = $1
                "#,
            )
            .bind(id)
            .execute(pool)
            .await?;
        }
        Disposition::Retry { delay_secs, error } => {
            sqlx::query(
                r#"
                UPDATE ledger_events
                SET next_attempt_at = NOW() + make_interval(secs => $2),
                    last_error = $3
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(*delay_secs as f64)
            .bind(error)
            .execute(pool)
            .await?;
        }
        Disposition::Failed { error } => {
            sqlx::query(
                r#"
                UPDATE ledger_events
                SET status = 'failed', processed_at = NOW(), last_error = $2
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(error)
            .execute(pool)
            .await?;
        }
    }
    Ok(())
}

/// Process one batch of queued ledger events
pub async fn process_event_queue(
    pool: &PgPool,
    dispatcher: &TriggerDispatcher,
    batch_size: i64,
    max_attempts: i32,
) -> QueueRunSummary {
    let mut summary = QueueRunSummary::default();

    let events = match claim_events(pool, batch_size).await {
        Ok(events) => events,
        Err(e) => {
            error!(error = %e, "Failed to claim ledger events");
            return summary;
        }
    };
    summary.claimed = events.len();
    if events.is_empty() {
        return summary;
    }

    for event in events {
        let outcome = match LedgerEvent::from_parts(&event.event_type, event.payload) {
            Ok(parsed) => dispatcher.dispatch(&parsed).await,
            Err(e) => {
                warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Malformed ledger event"
                );
                TriggerOutcome::Failed {
                    error: format!("malformed payload: {}", e),
                    retryable: false,
                }
            }
        };

        let disposition = disposition(&outcome, event.attempts, max_attempts);
        match &disposition {
            Disposition::Processed => summary.processed += 1,
            Disposition::Retry { delay_secs, .. } => {
                summary.retried += 1;
                warn!(
                    event_id = %event.id,
                    attempts = event.attempts,
                    retry_in_secs = delay_secs,
                    "Ledger event will be retried"
                );
            }
            Disposition::Failed { error } => {
                summary.failed += 1;
                error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    attempts = event.attempts,
                    error = %error,
                    "Ledger event failed permanently"
                );
            }
        }

        if let Err(e) = record(pool, event.id, &disposition).await {
            // The lease expires and the event is redelivered
            error!(event_id = %event.id, error = %e, "Failed to record event outcome");
        }
    }

    info!(
        claimed = summary.claimed,
        processed = summary.processed,
        retried = summary.retried,
        failed = summary.failed,
        "Ledger event batch complete"
    );
    summary
}

/// Delete processed events older than `retention`
pub async fn cleanup_processed_events(pool: &PgPool, retention: Duration) {
    let result = sqlx::query(
        r#"
        DELETE FROM ledger_events
        WHERE status = 'processed'
          AND processed_at < NOW() - make_interval(secs => $1)
        "#,
    )
    .bind(retention.as_secs_f64())
    .execute(pool)
    .await;

    match result {
        Ok(r) => info!(deleted = r.rows_affected(), "Ledger event cleanup complete"),
        Err(e) => error!(error = %e, "Ledger event cleanup failed"),
    }
}
