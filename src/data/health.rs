//! Global circuit breaker against the scraping provider.
//!
//! A single `apify_health` row tracks consecutive failures. Once the
//! configured trigger is reached the provider is paused for a cooldown
//! window and the counter resets, so the next trigger needs a fresh run
//! of failures. Workers consult `pause_until` before consuming any job;
//! jobs bounced by an active pause are retried at `pause_until` without
//! spending an attempt.

use crate::error::Result;
use crate::util::truncate_error;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

/// Current pause boundary, possibly in the past.
pub async fn get_pause_until(pool: &PgPool) -> Result<Option<DateTime<Utc>>> {
    let row: Option<(Option<DateTime<Utc>>,)> =
        sqlx::query_as("SELECT pause_until FROM apify_health WHERE id = 1")
            .fetch_optional(pool)
            .await?;
    Ok(row.and_then(|(pause,)| pause))
}

/// A successful provider call closes the breaker entirely.
pub async fn record_success(pool: &PgPool) -> Result<()> {
    sqlx::query(
        "UPDATE apify_health
         SET consecutive_failures = 0,
             pause_until = NULL,
             last_error = NULL,
             updated_at = NOW()
         WHERE id = 1",
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Record a provider failure; opens the breaker when the trigger count is
/// reached.
///
/// Returns the failure count after the increment and the pause boundary
/// when this failure tripped the breaker.
pub async fn record_failure(
    pool: &PgPool,
    error: &str,
    trigger_failures: i32,
    cooldown_hours: i32,
) -> Result<(i32, Option<DateTime<Utc>>)> {
    let (failures,): (i32,) = sqlx::query_as(
        "UPDATE apify_health
         SET consecutive_failures = consecutive_failures + 1,
             last_error = $1,
             updated_at = NOW()
         WHERE id = 1
         RETURNING consecutive_failures",
    )
    .bind(truncate_error(error))
    .fetch_one(pool)
    .await?;

    if failures < trigger_failures.max(1) {
        return Ok((failures, None));
    }

    let (pause_until,): (Option<DateTime<Utc>>,) = sqlx::query_as(
        "UPDATE apify_health
         SET pause_until = NOW() + make_interval(hours => $1),
             consecutive_failures = 0,
             updated_at = NOW()
         WHERE id = 1
         RETURNING pause_until",
    )
    .bind(cooldown_hours.max(1))
    .fetch_one(pool)
    .await?;

    Ok((failures, pause_until))
}
