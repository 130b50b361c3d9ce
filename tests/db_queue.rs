#[allow(dead_code)]
mod helpers;

use chrono::{TimeDelta, Utc};
use feedpulse::data::queue;
use sqlx::PgPool;

// ── handle queue ────────────────────────────────────────────────────

#[sqlx::test]
async fn fetch_handle_job_empty_queue(pool: PgPool) {
    let result = queue::fetch_next_handle_job(&pool).await.unwrap();
    assert!(result.is_none());
}

#[sqlx::test]
async fn enqueue_handle_is_deduplicated_while_pending(pool: PgPool) {
    let sub = helpers::insert_subscriber(&pool, "Acme", "sheet-1").await;
    queue::enqueue_handle(&pool, sub, "sheet-1", "@acme", "daily")
        .await
        .unwrap();
    queue::enqueue_handle(&pool, sub, "sheet-1", "@acme", "daily")
        .await
        .unwrap();

    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM run_queue")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[sqlx::test]
async fn enqueue_handle_allows_requeue_after_terminal_state(pool: PgPool) {
    let sub = helpers::insert_subscriber(&pool, "Acme", "sheet-1").await;
    queue::enqueue_handle(&pool, sub, "sheet-1", "@acme", "daily")
        .await
        .unwrap();

    let job = queue::fetch_next_handle_job(&pool).await.unwrap().unwrap();
    queue::mark_handle_job_success(&pool, job.id).await.unwrap();

    queue::enqueue_handle(&pool, sub, "sheet-1", "@acme", "daily")
        .await
        .unwrap();
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM run_queue")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 2);
}

#[sqlx::test]
async fn fetch_handle_job_claims_and_marks_running(pool: PgPool) {
    let sub = helpers::insert_subscriber(&pool, "Acme", "sheet-1").await;
    queue::enqueue_handle(&pool, sub, "sheet-1", "@acme", "daily")
        .await
        .unwrap();

    let job = queue::fetch_next_handle_job(&pool).await.unwrap().unwrap();
    assert_eq!(job.handle, "@acme");
    assert_eq!(job.run_type, "daily");

    let (status,): (String,) = sqlx::query_as("SELECT status FROM run_queue WHERE id = $1")
        .bind(job.id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(status, "running");

    // The claimed job is no longer visible to other workers.
    assert!(queue::fetch_next_handle_job(&pool).await.unwrap().is_none());
}

#[sqlx::test]
async fn fetch_handle_job_skips_future_next_run_at(pool: PgPool) {
    let sub = helpers::insert_subscriber(&pool, "Acme", "sheet-1").await;
    sqlx::query(
        "INSERT INTO run_queue (subscriber_id, spreadsheet_id, handle, run_type, status, next_run_at)
         VALUES ($1, 'sheet-1', '@acme', 'daily', 'retry', NOW() + INTERVAL '1 hour')",
    )
    .bind(sub)
    .execute(&pool)
    .await
    .unwrap();

    assert!(queue::fetch_next_handle_job(&pool).await.unwrap().is_none());
}

#[sqlx::test]
async fn fetch_handle_job_is_fifo_within_ready_set(pool: PgPool) {
    let sub = helpers::insert_subscriber(&pool, "Acme", "sheet-1").await;
    for (handle, minutes_ago) in [("@later", 1i32), ("@earlier", 10i32)] {
        sqlx::query(
            "INSERT INTO run_queue (subscriber_id, spreadsheet_id, handle, run_type, status, next_run_at)
             VALUES ($1, 'sheet-1', $2, 'daily', 'pending', NOW() - make_interval(mins => $3))",
        )
        .bind(sub)
        .bind(handle)
        .bind(minutes_ago)
        .execute(&pool)
        .await
        .unwrap();
    }

    let first = queue::fetch_next_handle_job(&pool).await.unwrap().unwrap();
    assert_eq!(first.handle, "@earlier");
}

// ── post queue ──────────────────────────────────────────────────────

#[sqlx::test]
async fn checkpoint_jobs_are_created_once_per_checkpoint(pool: PgPool) {
    let sub = helpers::insert_subscriber(&pool, "Acme", "sheet-1").await;
    let posted_at = Utc::now() - TimeDelta::hours(2);

    queue::ensure_post_checkpoint_jobs(&pool, sub, "sheet-1", "@acme", "https://x/p/a/", posted_at)
        .await
        .unwrap();
    // Re-ingesting the same post is a no-op.
    queue::ensure_post_checkpoint_jobs(&pool, sub, "sheet-1", "@acme", "https://x/p/a/", posted_at)
        .await
        .unwrap();

    let rows: Vec<(String, bool)> = sqlx::query_as(
        "SELECT checkpoint, requires_d7_hot FROM post_queue ORDER BY next_run_at ASC",
    )
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(
        rows,
        vec![
            ("d3".to_string(), false),
            ("d7".to_string(), false),
            ("d21".to_string(), true),
        ]
    );

    let (d21_at,): (chrono::DateTime<Utc>,) =
        sqlx::query_as("SELECT next_run_at FROM post_queue WHERE checkpoint = 'd21'")
            .fetch_one(&pool)
            .await
            .unwrap();
    // Postgres stores microseconds; compare with a small tolerance.
    let skew = (d21_at - (posted_at + TimeDelta::days(21))).num_milliseconds().abs();
    assert!(skew < 5, "d21 should fire 21 days after posted_at");
}

#[sqlx::test]
async fn post_batch_claims_only_same_key_rows(pool: PgPool) {
    let sub = helpers::insert_subscriber(&pool, "Acme", "sheet-1").await;
    let ready = Utc::now() - TimeDelta::minutes(5);

    for url in ["https://x/p/a/", "https://x/p/b/", "https://x/p/c/"] {
        helpers::insert_post_job(&pool, sub, "@acme", url, "d3", "pending", 0, ready).await;
    }
    // Same handle, different checkpoint: must not join the batch.
    helpers::insert_post_job(&pool, sub, "@acme", "https://x/p/d/", "d7", "pending", 0, ready)
        .await;
    // Different handle entirely.
    helpers::insert_post_job(&pool, sub, "@other", "https://x/p/e/", "d3", "pending", 0, ready)
        .await;

    let batch = queue::fetch_next_post_job_batch(&pool, 10).await.unwrap();
    assert_eq!(batch.len(), 3);
    assert!(batch.iter().all(|j| j.handle == "@acme" && j.checkpoint == "d3"));

    let (running,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM post_queue WHERE status = 'running'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(running, 3);

    // The other keys are still claimable afterwards.
    let next = queue::fetch_next_post_job_batch(&pool, 10).await.unwrap();
    assert_eq!(next.len(), 1);
}

#[sqlx::test]
async fn post_batch_respects_batch_size(pool: PgPool) {
    let sub = helpers::insert_subscriber(&pool, "Acme", "sheet-1").await;
    let ready = Utc::now() - TimeDelta::minutes(5);
    for i in 0..5 {
        let url = format!("https://x/p/{i}/");
        helpers::insert_post_job(&pool, sub, "@acme", &url, "d3", "pending", 0, ready).await;
    }

    let batch = queue::fetch_next_post_job_batch(&pool, 2).await.unwrap();
    assert_eq!(batch.len(), 2);
}

#[sqlx::test]
async fn post_job_unique_per_checkpoint(pool: PgPool) {
    let sub = helpers::insert_subscriber(&pool, "Acme", "sheet-1").await;
    let ready = Utc::now();
    helpers::insert_post_job(&pool, sub, "@acme", "https://x/p/a/", "d3", "pending", 0, ready)
        .await;

    let duplicate = sqlx::query(
        "INSERT INTO post_queue (subscriber_id, handle, post_url, checkpoint, status)
         VALUES ($1, '@acme', 'https://x/p/a/', 'd3', 'pending')",
    )
    .bind(sub)
    .execute(&pool)
    .await;
    assert!(duplicate.is_err(), "duplicate checkpoint row must be rejected");
}

#[sqlx::test]
async fn mark_retry_updates_attempt_and_truncates_error(pool: PgPool) {
    let sub = helpers::insert_subscriber(&pool, "Acme", "sheet-1").await;
    let id = helpers::insert_post_job(
        &pool,
        sub,
        "@acme",
        "https://x/p/a/",
        "d3",
        "running",
        0,
        Utc::now(),
    )
    .await;

    let long_error = "x".repeat(5000);
    let next = Utc::now() + TimeDelta::minutes(15);
    queue::mark_post_job_retry(&pool, id, 1, next, &long_error)
        .await
        .unwrap();

    let (status, attempt, error): (String, i32, String) =
        sqlx::query_as("SELECT status, attempt, last_error FROM post_queue WHERE id = $1")
            .bind(id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(status, "retry");
    assert_eq!(attempt, 1);
    assert_eq!(error.chars().count(), 1000);
}

#[sqlx::test]
async fn mark_skipped_records_reason(pool: PgPool) {
    let sub = helpers::insert_subscriber(&pool, "Acme", "sheet-1").await;
    let id = helpers::insert_post_job(
        &pool,
        sub,
        "@acme",
        "https://x/p/a/",
        "d21",
        "running",
        0,
        Utc::now(),
    )
    .await;

    queue::mark_post_job_skipped(&pool, id, "D7 not hot; D21 skipped by gate")
        .await
        .unwrap();

    let (status, error): (String, String) =
        sqlx::query_as("SELECT status, last_error FROM post_queue WHERE id = $1")
            .bind(id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(status, "skipped");
    assert!(error.contains("D21 skipped"));
}
