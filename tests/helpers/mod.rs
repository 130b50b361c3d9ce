use chrono::{DateTime, TimeDelta, Utc};
use feedpulse::apify::normalize::NormalizedPost;
use sqlx::PgPool;

/// Insert an active subscriber, returning its ID.
pub async fn insert_subscriber(pool: &PgPool, name: &str, spreadsheet_id: &str) -> i64 {
    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO subscribers (name, spreadsheet_id) VALUES ($1, $2) RETURNING id",
    )
    .bind(name)
    .bind(spreadsheet_id)
    .fetch_one(pool)
    .await
    .expect("insert_subscriber failed");
    id
}

/// Insert an active feed for a subscriber, returning its ID.
pub async fn insert_feed(pool: &PgPool, subscriber_id: i64, mode: &str) -> i64 {
    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO feeds (subscriber_id, name, mode) VALUES ($1, 'Test Feed', $2) RETURNING id",
    )
    .bind(subscriber_id)
    .bind(mode)
    .fetch_one(pool)
    .await
    .expect("insert_feed failed");
    id
}

pub async fn insert_feeder(pool: &PgPool, feed_id: i64, handle: &str, role: &str) -> i64 {
    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO feeders (feed_id, handle, role) VALUES ($1, $2, $3) RETURNING id",
    )
    .bind(feed_id)
    .bind(handle)
    .bind(role)
    .fetch_one(pool)
    .await
    .expect("insert_feeder failed");
    id
}

/// Insert a post-queue row directly, returning the generated ID.
#[allow(clippy::too_many_arguments)]
pub async fn insert_post_job(
    pool: &PgPool,
    subscriber_id: i64,
    handle: &str,
    post_url: &str,
    checkpoint: &str,
    status: &str,
    attempt: i32,
    next_run_at: DateTime<Utc>,
) -> i64 {
    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO post_queue (subscriber_id, spreadsheet_id, handle, post_url, checkpoint,
                                 requires_d7_hot, attempt, next_run_at, status)
         VALUES ($1, 'sheet-1', $2, $3, $4, $5, $6, $7, $8)
         RETURNING id",
    )
    .bind(subscriber_id)
    .bind(handle)
    .bind(post_url)
    .bind(checkpoint)
    .bind(checkpoint == "d21")
    .bind(attempt)
    .bind(next_run_at)
    .bind(status)
    .fetch_one(pool)
    .await
    .expect("insert_post_job failed");
    id
}

/// Insert a checkpoint metric row directly (bypassing feed resolution).
#[allow(clippy::too_many_arguments)]
pub async fn insert_checkpoint_metric(
    pool: &PgPool,
    subscriber_id: i64,
    feed_id: i64,
    feeder_id: i64,
    handle: &str,
    post_url: &str,
    checkpoint: &str,
    media_type: &str,
    velocity_tag: &str,
    metric_value: f64,
    velocity_value: f64,
    checkpoint_age_days: i64,
) {
    sqlx::query(
        "INSERT INTO post_checkpoint_metrics (
            subscriber_id, feed_id, feeder_id, handle, post_url, checkpoint, checkpoint_at,
            stage_label, media_type, metric_value, velocity_value, velocity_tag
         )
         VALUES ($1, $2, $3, $4, $5, $6, $7, UPPER($6), $8, $9, $10, $11)",
    )
    .bind(subscriber_id)
    .bind(feed_id)
    .bind(feeder_id)
    .bind(handle)
    .bind(post_url)
    .bind(checkpoint)
    .bind(Utc::now() - TimeDelta::days(checkpoint_age_days))
    .bind(media_type)
    .bind(metric_value)
    .bind(velocity_value)
    .bind(velocity_tag)
    .execute(pool)
    .await
    .expect("insert_checkpoint_metric failed");
}

/// Build a normalized video post with the given counters.
pub fn make_video_post(post_url: &str, posted_at: DateTime<Utc>, views: i32) -> NormalizedPost {
    NormalizedPost {
        post_url: post_url.to_string(),
        posted_at: Some(posted_at),
        handle: "acme".to_string(),
        media_type: "Video".to_string(),
        views: Some(views),
        likes: Some(10),
        comments: Some(2),
        caption: "test caption".to_string(),
        ..Default::default()
    }
}
