//! Signal aggregate rebuilds.
//!
//! For each feed and checkpoint window, recent checkpoint metrics are
//! collapsed into per-dimension aggregates (media type, velocity tag)
//! carrying adoption, velocity delta against the decayed feed baseline,
//! saturation, and confidence. Each rebuild replaces the window's rows
//! wholesale, so reruns without new data are idempotent.

use crate::error::Result;
use sqlx::PgPool;
use tracing::debug;

const WINDOWS: [&str; 5] = ["d1", "d2", "d3", "d7", "d21"];

/// Time-decay weighted average velocity: weight `1 / (1 + age_days)`.
const DECAYED_AVG: &str = "COALESCE(
    SUM(velocity_value * (1.0 / (1.0 + GREATEST(0.0, EXTRACT(EPOCH FROM (NOW() - checkpoint_at)) / 86400.0))))
    /
    NULLIF(SUM(1.0 / (1.0 + GREATEST(0.0, EXTRACT(EPOCH FROM (NOW() - checkpoint_at)) / 86400.0))), 0),
    0
)";

#[derive(Debug, sqlx::FromRow)]
struct WindowSummary {
    total_rows: i64,
    base_velocity: f64,
    source_start_at: Option<chrono::DateTime<chrono::Utc>>,
    source_end_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, sqlx::FromRow)]
struct GroupRow {
    signal_key: String,
    n: i64,
    avg_velocity: f64,
}

/// Rebuild aggregates for every active feed, optionally scoped to one
/// subscriber.
pub async fn rebuild_for_subscriber(
    pool: &PgPool,
    subscriber_id: Option<i64>,
    lookback_days: i32,
) -> Result<()> {
    let feed_ids: Vec<(i64,)> = match subscriber_id {
        None => {
            sqlx::query_as("SELECT id FROM feeds WHERE status = 'active' ORDER BY id")
                .fetch_all(pool)
                .await?
        }
        Some(id) => sqlx::query_as(
            "SELECT id FROM feeds WHERE status = 'active' AND subscriber_id = $1 ORDER BY id",
        )
        .bind(id)
        .fetch_all(pool)
        .await?,
    };

    for (feed_id,) in feed_ids {
        rebuild_feed(pool, feed_id, lookback_days).await?;
    }
    Ok(())
}

/// Rebuild all windows for one feed.
pub async fn rebuild_feed(pool: &PgPool, feed_id: i64, lookback_days: i32) -> Result<()> {
    for window_key in WINDOWS {
        rebuild_window(pool, feed_id, window_key, lookback_days).await?;
    }
    Ok(())
}

async fn rebuild_window(
    pool: &PgPool,
    feed_id: i64,
    window_key: &str,
    lookback_days: i32,
) -> Result<()> {
    let summary_sql = format!(
        "SELECT COUNT(*) AS total_rows,
                {DECAYED_AVG}::FLOAT8 AS base_velocity,
                MIN(checkpoint_at) AS source_start_at,
                MAX(checkpoint_at) AS source_end_at
         FROM post_checkpoint_metrics
         WHERE feed_id = $1
           AND checkpoint = $2
           AND checkpoint_at >= NOW() - make_interval(days => $3)
           AND velocity_value IS NOT NULL"
    );
    let summary = sqlx::query_as::<_, WindowSummary>(&summary_sql)
        .bind(feed_id)
        .bind(window_key)
        .bind(lookback_days)
        .fetch_one(pool)
        .await?;

    sqlx::query("DELETE FROM signal_aggregates WHERE feed_id = $1 AND window_key = $2")
        .bind(feed_id)
        .bind(window_key)
        .execute(pool)
        .await?;

    if summary.total_rows == 0 {
        return Ok(());
    }

    // Media type groups, falling back to the canonical post record when the
    // metric row predates the media_type column.
    let media_sql = format!(
        "SELECT COALESCE(NULLIF(TRIM(COALESCE(pc.media_type, core.media_type)), ''), 'Unknown') AS signal_key,
                COUNT(*) AS n,
                COALESCE(
                  SUM(pc.velocity_value * (1.0 / (1.0 + GREATEST(0.0, EXTRACT(EPOCH FROM (NOW() - pc.checkpoint_at)) / 86400.0))))
                  /
                  NULLIF(SUM(1.0 / (1.0 + GREATEST(0.0, EXTRACT(EPOCH FROM (NOW() - pc.checkpoint_at)) / 86400.0))), 0),
                  0
                )::FLOAT8 AS avg_velocity
         FROM post_checkpoint_metrics pc
         LEFT JOIN posts_core core
           ON core.subscriber_id = pc.subscriber_id
          AND core.handle = pc.handle
          AND core.post_url = pc.post_url
         WHERE pc.feed_id = $1
           AND pc.checkpoint = $2
           AND pc.checkpoint_at >= NOW() - make_interval(days => $3)
           AND pc.velocity_value IS NOT NULL
         GROUP BY 1
         HAVING COUNT(*) >= 2
         ORDER BY n DESC"
    );
    let media_rows = sqlx::query_as::<_, GroupRow>(&media_sql)
        .bind(feed_id)
        .bind(window_key)
        .bind(lookback_days)
        .fetch_all(pool)
        .await?;
    for row in &media_rows {
        insert_aggregate(pool, feed_id, "media_type", window_key, &summary, row, 15.0).await?;
    }

    let tag_sql = format!(
        "SELECT COALESCE(NULLIF(TRIM(velocity_tag), ''), 'none') AS signal_key,
                COUNT(*) AS n,
                {DECAYED_AVG}::FLOAT8 AS avg_velocity
         FROM post_checkpoint_metrics
         WHERE feed_id = $1
           AND checkpoint = $2
           AND checkpoint_at >= NOW() - make_interval(days => $3)
           AND velocity_value IS NOT NULL
         GROUP BY 1
         HAVING COUNT(*) >= 2
         ORDER BY n DESC"
    );
    let tag_rows = sqlx::query_as::<_, GroupRow>(&tag_sql)
        .bind(feed_id)
        .bind(window_key)
        .bind(lookback_days)
        .fetch_all(pool)
        .await?;
    for row in &tag_rows {
        insert_aggregate(pool, feed_id, "velocity_tag", window_key, &summary, row, 12.0).await?;
    }

    debug!(
        feed_id,
        window_key,
        total_rows = summary.total_rows,
        media_groups = media_rows.len(),
        tag_groups = tag_rows.len(),
        "signal aggregates rebuilt"
    );
    Ok(())
}

async fn insert_aggregate(
    pool: &PgPool,
    feed_id: i64,
    signal_type: &str,
    window_key: &str,
    summary: &WindowSummary,
    group: &GroupRow,
    confidence_divisor: f64,
) -> Result<()> {
    let adoption_rate = group.n as f64 / summary.total_rows as f64;
    let velocity_delta = group.avg_velocity - summary.base_velocity;
    let confidence = (group.n as f64 / confidence_divisor).min(1.0);
    let damping = if velocity_delta <= 0.0 { 1.0 } else { 0.5 };
    let saturation_score = (adoption_rate * damping).clamp(0.0, 1.0);

    sqlx::query(
        "INSERT INTO signal_aggregates (
            feed_id, signal_type, signal_key, window_key,
            adoption_rate, velocity_delta, saturation_score, confidence,
            sample_size, source_start_at, source_end_at, created_at, updated_at
         )
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW(), NOW())
         ON CONFLICT (feed_id, signal_type, signal_key, window_key)
         DO UPDATE SET
            adoption_rate = EXCLUDED.adoption_rate,
            velocity_delta = EXCLUDED.velocity_delta,
            saturation_score = EXCLUDED.saturation_score,
            confidence = EXCLUDED.confidence,
            sample_size = EXCLUDED.sample_size,
            source_start_at = EXCLUDED.source_start_at,
            source_end_at = EXCLUDED.source_end_at,
            updated_at = NOW()",
    )
    .bind(feed_id)
    .bind(signal_type)
    .bind(&group.signal_key)
    .bind(window_key)
    .bind(adoption_rate)
    .bind(velocity_delta)
    .bind(saturation_score)
    .bind(confidence)
    .bind(group.n as i32)
    .bind(summary.source_start_at)
    .bind(summary.source_end_at)
    .execute(pool)
    .await?;
    Ok(())
}
