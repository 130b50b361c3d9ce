//! Subscribers, feeds, and feeders.
//!
//! A subscriber owns exactly one active feed; a feed owns the tracked
//! handles as feeder rows. All post-level writes resolve `(feed_id,
//! feeder_id)` through the get-or-create helpers here so references stay
//! populated for the aggregation and alert layers.

use crate::data::models::{Feed, Feeder, Subscriber};
use crate::error::Result;
use serde_json::json;
use sqlx::{PgExecutor, PgPool};

/// An active feed joined with its subscriber's spreadsheet.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ActiveFeed {
    pub id: i64,
    pub subscriber_id: i64,
    pub name: String,
    pub mode: String,
    pub spreadsheet_id: String,
}

pub async fn list_subscribers(pool: &PgPool) -> Result<Vec<Subscriber>> {
    let rows = sqlx::query_as::<_, Subscriber>(
        "SELECT id, name, spreadsheet_id FROM subscribers WHERE status = 'active' ORDER BY id ASC",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn list_feeds(pool: &PgPool) -> Result<Vec<ActiveFeed>> {
    let rows = sqlx::query_as::<_, ActiveFeed>(
        "SELECT f.id, f.subscriber_id, f.name, f.mode, s.spreadsheet_id
         FROM feeds f
         JOIN subscribers s ON s.id = f.subscriber_id
         WHERE f.status = 'active' AND s.status = 'active'
         ORDER BY f.id ASC",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn get_feed_by_subscriber(pool: &PgPool, subscriber_id: i64) -> Result<Option<Feed>> {
    let row = sqlx::query_as::<_, Feed>(
        "SELECT id, subscriber_id, name, mode, max_feeders, status
         FROM feeds
         WHERE subscriber_id = $1
         ORDER BY id ASC
         LIMIT 1",
    )
    .bind(subscriber_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// The subscriber's active feed id, creating a default market feed when
/// none exists yet.
pub async fn get_feed_id<'e, E: PgExecutor<'e> + Copy>(
    executor: E,
    subscriber_id: i64,
) -> Result<i64> {
    let existing: Option<(i64,)> = sqlx::query_as(
        "SELECT id FROM feeds
         WHERE subscriber_id = $1 AND status = 'active'
         ORDER BY id ASC
         LIMIT 1",
    )
    .bind(subscriber_id)
    .fetch_optional(executor)
    .await?;
    if let Some((id,)) = existing {
        return Ok(id);
    }

    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO feeds (subscriber_id, name, mode, max_feeders, status, created_at, updated_at)
         VALUES ($1, 'Default Feed', 'market', 15, 'active', NOW(), NOW())
         ON CONFLICT (subscriber_id) DO UPDATE SET updated_at = NOW()
         RETURNING id",
    )
    .bind(subscriber_id)
    .fetch_one(executor)
    .await?;
    Ok(id)
}

/// The feeder id for a handle within a feed, creating it on first sight.
pub async fn get_feeder_id<'e, E: PgExecutor<'e> + Copy>(
    executor: E,
    feed_id: i64,
    handle: &str,
) -> Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO feeders (feed_id, handle, role, status, created_at, updated_at, last_seen_at)
         VALUES ($1, $2, 'standard', 'active', NOW(), NOW(), NOW())
         ON CONFLICT (feed_id, handle)
         DO UPDATE SET updated_at = NOW(), last_seen_at = NOW()
         RETURNING id",
    )
    .bind(feed_id)
    .bind(handle)
    .fetch_one(executor)
    .await?;
    Ok(id)
}

/// Registry id for `(subscriber, handle)`, refreshing liveness on the way.
pub async fn get_handle_registry_id<'e, E: PgExecutor<'e> + Copy>(
    executor: E,
    subscriber_id: i64,
    handle: &str,
) -> Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO handle_registry (subscriber_id, handle, status, first_seen_at, last_seen_at)
         VALUES ($1, $2, 'active', NOW(), NOW())
         ON CONFLICT (subscriber_id, handle)
         DO UPDATE SET status = 'active', last_seen_at = NOW()
         RETURNING id",
    )
    .bind(subscriber_id)
    .bind(handle)
    .fetch_one(executor)
    .await?;
    Ok(id)
}

/// Reconcile a subscriber's feeder set with the handles currently listed
/// on its spreadsheet: listed handles become active feeders, everything
/// else is deactivated.
pub async fn ensure_feeders_for_subscriber(
    pool: &PgPool,
    subscriber_id: i64,
    handles: &[String],
) -> Result<()> {
    let feed_id = get_feed_id(pool, subscriber_id).await?;
    let mut clean: Vec<String> = Vec::new();
    for handle in handles {
        let value = handle.trim();
        if value.is_empty() {
            continue;
        }
        clean.push(value.to_string());
        get_feeder_id(pool, feed_id, value).await?;
    }

    sqlx::query(
        "UPDATE feeders
         SET status = 'inactive', updated_at = NOW()
         WHERE feed_id = $1
           AND handle <> ALL($2)
           AND status = 'active'",
    )
    .bind(feed_id)
    .bind(&clean)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn active_anchor(pool: &PgPool, feed_id: i64) -> Result<Option<Feeder>> {
    let row = sqlx::query_as::<_, Feeder>(
        "SELECT id, feed_id, handle, role, status
         FROM feeders
         WHERE feed_id = $1 AND role = 'anchor' AND status = 'active'
         LIMIT 1",
    )
    .bind(feed_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

#[derive(Debug, sqlx::FromRow)]
struct FeederAverages {
    avg_metric: f64,
    avg_velocity: f64,
    n: i64,
}

async fn feeder_averages(
    pool: &PgPool,
    feed_id: i64,
    feeder_id: i64,
    window_days: i32,
) -> Result<FeederAverages> {
    let row = sqlx::query_as::<_, FeederAverages>(
        "SELECT COALESCE(AVG(metric_value), 0)::FLOAT8 AS avg_metric,
                COALESCE(
                  SUM(velocity_value * (1.0 / (1.0 + GREATEST(0.0, EXTRACT(EPOCH FROM (NOW() - checkpoint_at)) / 86400.0))))
                  /
                  NULLIF(SUM(1.0 / (1.0 + GREATEST(0.0, EXTRACT(EPOCH FROM (NOW() - checkpoint_at)) / 86400.0))), 0),
                  0
                )::FLOAT8 AS avg_velocity,
                COUNT(*) AS n
         FROM post_checkpoint_metrics
         WHERE feed_id = $1
           AND feeder_id = $2
           AND checkpoint_at >= NOW() - make_interval(days => $3)",
    )
    .bind(feed_id)
    .bind(feeder_id)
    .bind(window_days)
    .fetch_one(pool)
    .await?;
    Ok(row)
}

/// Rebuild anchor-relative pair metrics for a feed.
///
/// Without an active anchor the rows are cleared. Otherwise every other
/// active feeder gets one row comparing its decayed average velocity and
/// raw average metric against the anchor's over the window.
pub async fn refresh_feeder_pair_metrics(
    pool: &PgPool,
    feed_id: i64,
    window_days: i32,
) -> Result<()> {
    let Some(anchor) = active_anchor(pool, feed_id).await? else {
        sqlx::query("DELETE FROM feeder_pair_metrics WHERE feed_id = $1")
            .bind(feed_id)
            .execute(pool)
            .await?;
        return Ok(());
    };

    let peers = sqlx::query_as::<_, Feeder>(
        "SELECT id, feed_id, handle, role, status
         FROM feeders
         WHERE feed_id = $1 AND status = 'active' AND id <> $2",
    )
    .bind(feed_id)
    .bind(anchor.id)
    .fetch_all(pool)
    .await?;

    let anchor_avg = feeder_averages(pool, feed_id, anchor.id, window_days).await?;

    for peer in peers {
        let peer_avg = feeder_averages(pool, feed_id, peer.id, window_days).await?;
        let sample_size = anchor_avg.n + peer_avg.n;
        let velocity_delta = peer_avg.avg_velocity - anchor_avg.avg_velocity;
        let perf_delta = peer_avg.avg_metric - anchor_avg.avg_metric;
        let relation_score = velocity_delta * 0.7 + perf_delta * 0.3;

        sqlx::query(
            "INSERT INTO feeder_pair_metrics (
                feed_id, anchor_feeder_id, feeder_id, window_days,
                velocity_delta, perf_delta, percentile_delta, relation_score,
                sample_size, metadata_json, computed_at, created_at, updated_at
             )
             VALUES ($1, $2, $3, $4, $5, $6, NULL, $7, $8, $9, NOW(), NOW(), NOW())
             ON CONFLICT (feed_id, anchor_feeder_id, feeder_id, window_days)
             DO UPDATE SET
                velocity_delta = EXCLUDED.velocity_delta,
                perf_delta = EXCLUDED.perf_delta,
                relation_score = EXCLUDED.relation_score,
                sample_size = EXCLUDED.sample_size,
                metadata_json = EXCLUDED.metadata_json,
                computed_at = NOW(),
                updated_at = NOW()",
        )
        .bind(feed_id)
        .bind(anchor.id)
        .bind(peer.id)
        .bind(window_days)
        .bind(velocity_delta)
        .bind(perf_delta)
        .bind(relation_score)
        .bind(sample_size as i32)
        .bind(json!({
            "anchor_handle": anchor.handle,
            "peer_handle": peer.handle,
        }))
        .execute(pool)
        .await?;
    }
    Ok(())
}
