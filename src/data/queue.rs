//! Queue operations for the handle scrape queue (`run_queue`) and the
//! per-post checkpoint queue (`post_queue`).
//!
//! Both queues share the same shape: rows in `pending`/`retry` become
//! claimable once `next_run_at` passes, claims are serialized with
//! `FOR UPDATE SKIP LOCKED`, and terminal states are `done`, `failed`,
//! and (post queue only) `skipped`.

use crate::data::models::{HandleJob, PostJob};
use crate::error::Result;
use crate::util::truncate_error;
use chrono::{DateTime, TimeDelta, Utc};
use sqlx::PgPool;

/// Next retry time from the configured backoff schedule.
///
/// `attempt` is 1-based; attempts beyond the schedule reuse its last slot
/// (the caller fails the job terminally once `attempt` exceeds the
/// schedule length).
pub fn next_retry_at(backoff_minutes: &[i64], attempt: i32) -> DateTime<Utc> {
    let idx = usize::try_from(attempt.max(1) - 1)
        .unwrap_or(0)
        .min(backoff_minutes.len().saturating_sub(1));
    let minutes = backoff_minutes.get(idx).copied().unwrap_or(15);
    Utc::now() + TimeDelta::minutes(minutes)
}

/// Insert a pending handle job. A `(subscriber, handle)` pair already
/// pending or retrying is left untouched.
pub async fn enqueue_handle(
    pool: &PgPool,
    subscriber_id: i64,
    spreadsheet_id: &str,
    handle: &str,
    run_type: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO run_queue (subscriber_id, spreadsheet_id, handle, run_type, status)
         VALUES ($1, $2, $3, $4, 'pending')
         ON CONFLICT DO NOTHING",
    )
    .bind(subscriber_id)
    .bind(spreadsheet_id)
    .bind(handle)
    .bind(run_type)
    .execute(pool)
    .await?;
    Ok(())
}

/// Create the three scheduled checkpoint jobs for a newly ingested post.
///
/// d3/d7/d21 fire at their offsets from `posted_at`; only d21 carries the
/// D7-hot gate. Existing `(subscriber, handle, post_url, checkpoint)` rows
/// are left untouched.
pub async fn ensure_post_checkpoint_jobs(
    pool: &PgPool,
    subscriber_id: i64,
    spreadsheet_id: &str,
    handle: &str,
    post_url: &str,
    posted_at: DateTime<Utc>,
) -> Result<()> {
    if post_url.is_empty() {
        return Ok(());
    }
    let checkpoints = [
        ("d3", posted_at + TimeDelta::days(3), false),
        ("d7", posted_at + TimeDelta::days(7), false),
        ("d21", posted_at + TimeDelta::days(21), true),
    ];
    for (checkpoint, run_at, requires_d7_hot) in checkpoints {
        sqlx::query(
            "INSERT INTO post_queue (
                subscriber_id, spreadsheet_id, handle, post_url, checkpoint,
                requires_d7_hot, next_run_at, status
             )
             VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending')
             ON CONFLICT (subscriber_id, handle, post_url, checkpoint) DO NOTHING",
        )
        .bind(subscriber_id)
        .bind(spreadsheet_id)
        .bind(handle)
        .bind(post_url)
        .bind(checkpoint)
        .bind(requires_d7_hot)
        .bind(run_at)
        .execute(pool)
        .await?;
    }
    Ok(())
}

/// Atomically claim the next ready handle job.
///
/// Ready rows are ordered strictly by `next_run_at, id`; the claim marks
/// the row `running` inside the same transaction so concurrent workers
/// each land on distinct rows.
pub async fn fetch_next_handle_job(pool: &PgPool) -> Result<Option<HandleJob>> {
    let mut tx = pool.begin().await?;

    let job = sqlx::query_as::<_, HandleJob>(
        "SELECT * FROM run_queue
         WHERE status IN ('pending', 'retry')
           AND next_run_at <= NOW()
         ORDER BY next_run_at ASC, id ASC
         LIMIT 1
         FOR UPDATE SKIP LOCKED",
    )
    .fetch_optional(&mut *tx)
    .await?;

    if let Some(ref job) = job {
        sqlx::query("UPDATE run_queue SET status = 'running', updated_at = NOW() WHERE id = $1")
            .bind(job.id)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(job)
}

/// Atomically claim up to `batch_size` ready post jobs sharing one
/// `(subscriber, handle, checkpoint)` key.
///
/// The first ready row anchors the batch; only rows matching its key are
/// claimed alongside it. The grouping keeps a single provider call
/// covering the whole batch.
pub async fn fetch_next_post_job_batch(pool: &PgPool, batch_size: i64) -> Result<Vec<PostJob>> {
    let mut tx = pool.begin().await?;

    let anchor = sqlx::query_as::<_, PostJob>(
        "SELECT * FROM post_queue
         WHERE status IN ('pending', 'retry')
           AND next_run_at <= NOW()
         ORDER BY next_run_at ASC, id ASC
         LIMIT 1
         FOR UPDATE SKIP LOCKED",
    )
    .fetch_optional(&mut *tx)
    .await?;

    let Some(anchor) = anchor else {
        tx.commit().await?;
        return Ok(Vec::new());
    };

    let mut jobs = vec![anchor.clone()];
    if batch_size > 1 {
        let rest = sqlx::query_as::<_, PostJob>(
            "SELECT * FROM post_queue
             WHERE status IN ('pending', 'retry')
               AND next_run_at <= NOW()
               AND subscriber_id = $1
               AND handle = $2
               AND checkpoint = $3
               AND id <> $4
             ORDER BY next_run_at ASC, id ASC
             LIMIT $5
             FOR UPDATE SKIP LOCKED",
        )
        .bind(anchor.subscriber_id)
        .bind(&anchor.handle)
        .bind(&anchor.checkpoint)
        .bind(anchor.id)
        .bind(batch_size - 1)
        .fetch_all(&mut *tx)
        .await?;
        jobs.extend(rest);
    }

    let ids: Vec<i64> = jobs.iter().map(|j| j.id).collect();
    sqlx::query("UPDATE post_queue SET status = 'running', updated_at = NOW() WHERE id = ANY($1)")
        .bind(&ids)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(jobs)
}

pub async fn mark_handle_job_success(pool: &PgPool, job_id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE run_queue SET status = 'done', last_error = NULL, updated_at = NOW() WHERE id = $1",
    )
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_handle_job_retry(
    pool: &PgPool,
    job_id: i64,
    attempt: i32,
    next_run_at: DateTime<Utc>,
    error: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE run_queue
         SET status = 'retry', attempt = $2, next_run_at = $3, last_error = $4, updated_at = NOW()
         WHERE id = $1",
    )
    .bind(job_id)
    .bind(attempt)
    .bind(next_run_at)
    .bind(truncate_error(error))
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_handle_job_failed(pool: &PgPool, job_id: i64, error: &str) -> Result<()> {
    sqlx::query(
        "UPDATE run_queue SET status = 'failed', last_error = $2, updated_at = NOW() WHERE id = $1",
    )
    .bind(job_id)
    .bind(truncate_error(error))
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_post_job_success(pool: &PgPool, job_id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE post_queue SET status = 'done', last_error = NULL, updated_at = NOW() WHERE id = $1",
    )
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_post_job_retry(
    pool: &PgPool,
    job_id: i64,
    attempt: i32,
    next_run_at: DateTime<Utc>,
    error: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE post_queue
         SET status = 'retry', attempt = $2, next_run_at = $3, last_error = $4, updated_at = NOW()
         WHERE id = $1",
    )
    .bind(job_id)
    .bind(attempt)
    .bind(next_run_at)
    .bind(truncate_error(error))
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_post_job_failed(pool: &PgPool, job_id: i64, error: &str) -> Result<()> {
    sqlx::query(
        "UPDATE post_queue SET status = 'failed', last_error = $2, updated_at = NOW() WHERE id = $1",
    )
    .bind(job_id)
    .bind(truncate_error(error))
    .execute(pool)
    .await?;
    Ok(())
}

/// Terminal skip, used by the D21 gate. The reason lands in `last_error`.
pub async fn mark_post_job_skipped(pool: &PgPool, job_id: i64, reason: &str) -> Result<()> {
    sqlx::query(
        "UPDATE post_queue SET status = 'skipped', last_error = $2, updated_at = NOW() WHERE id = $1",
    )
    .bind(job_id)
    .bind(truncate_error(reason))
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_is_indexed_by_attempt() {
        let backoff = [15, 30, 60];
        let now = Utc::now();

        let first = next_retry_at(&backoff, 1) - now;
        assert!((first.num_minutes() - 15).abs() <= 1);

        let second = next_retry_at(&backoff, 2) - now;
        assert!((second.num_minutes() - 30).abs() <= 1);

        // Beyond the schedule the last slot repeats.
        let beyond = next_retry_at(&backoff, 9) - now;
        assert!((beyond.num_minutes() - 60).abs() <= 1);
    }
}
