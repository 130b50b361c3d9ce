//! Post-level persistence: canonical post records, checkpoint snapshots,
//! per-checkpoint metrics, and the user-visible post signal.

use crate::apify::normalize::NormalizedPost;
use crate::data::feeds::{get_feed_id, get_feeder_id, get_handle_registry_id};
use crate::data::models::{Checkpoint, PostSignalFields, PostSnapshot};
use crate::error::Result;
use crate::util::{shortcode_from_url, truncate_error};
use crate::velocity::metric_value;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashMap;

/// Upsert the canonical post record from a normalized provider item.
///
/// `posted_at` is sticky: a later scrape without a timestamp never blanks
/// an earlier one.
pub async fn upsert_post_core(
    pool: &PgPool,
    subscriber_id: i64,
    handle: &str,
    norm: &NormalizedPost,
) -> Result<()> {
    let feed_id = get_feed_id(pool, subscriber_id).await?;
    get_feeder_id(pool, feed_id, handle).await?;
    let handle_registry_id = get_handle_registry_id(pool, subscriber_id, handle).await?;

    sqlx::query(
        "INSERT INTO posts_core (
            subscriber_id, handle_id, handle, post_url, media_type, duration_seconds, posted_at,
            caption, hashtags, caption_mentions, tagged_users, music_info, is_pinned,
            paid_partnership, sponsors, display_url, video_url, last_scanned_at, created_at, updated_at
         )
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, NOW(), NOW(), NOW())
         ON CONFLICT (subscriber_id, handle, post_url)
         DO UPDATE SET
            handle_id = EXCLUDED.handle_id,
            media_type = EXCLUDED.media_type,
            duration_seconds = EXCLUDED.duration_seconds,
            posted_at = COALESCE(EXCLUDED.posted_at, posts_core.posted_at),
            caption = EXCLUDED.caption,
            hashtags = EXCLUDED.hashtags,
            caption_mentions = EXCLUDED.caption_mentions,
            tagged_users = EXCLUDED.tagged_users,
            music_info = EXCLUDED.music_info,
            is_pinned = EXCLUDED.is_pinned,
            paid_partnership = EXCLUDED.paid_partnership,
            sponsors = EXCLUDED.sponsors,
            display_url = EXCLUDED.display_url,
            video_url = EXCLUDED.video_url,
            last_scanned_at = NOW(),
            updated_at = NOW()",
    )
    .bind(subscriber_id)
    .bind(handle_registry_id)
    .bind(handle)
    .bind(&norm.post_url)
    .bind(&norm.media_type)
    .bind(norm.duration_seconds)
    .bind(norm.posted_at)
    .bind(&norm.caption)
    .bind(&norm.hashtags)
    .bind(&norm.caption_mentions)
    .bind(&norm.tagged_users)
    .bind(&norm.music_info)
    .bind(norm.is_pinned)
    .bind(norm.paid_partnership)
    .bind(&norm.sponsors)
    .bind(&norm.display_url)
    .bind(&norm.video_url)
    .execute(pool)
    .await?;
    Ok(())
}

/// Merge a scrape into one checkpoint column of the post's snapshot row.
///
/// The counters are latest-write-wins; the checkpoint's `*_at` and the
/// row's `media_type` are first-write-wins.
pub async fn upsert_snapshot(
    pool: &PgPool,
    subscriber_id: i64,
    handle: &str,
    post_url: &str,
    media_type: Option<&str>,
    posted_at: Option<DateTime<Utc>>,
    checkpoint: Checkpoint,
    views: Option<i32>,
    likes: Option<i32>,
    comments: Option<i32>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO post_snapshots (subscriber_id, handle, post_url, media_type, posted_at)
         VALUES ($1, $2, $3, $4, $5)
         ON CONFLICT (subscriber_id, handle, post_url) DO NOTHING",
    )
    .bind(subscriber_id)
    .bind(handle)
    .bind(post_url)
    .bind(media_type)
    .bind(posted_at)
    .execute(pool)
    .await?;

    // Column names come from the closed checkpoint enum, never from input.
    let (at_col, v_col, l_col, c_col) = checkpoint.snapshot_columns();
    let sql = format!(
        "UPDATE post_snapshots
         SET media_type = COALESCE(media_type, $1),
             {at_col} = COALESCE({at_col}, NOW()),
             {v_col} = $2,
             {l_col} = $3,
             {c_col} = $4,
             updated_at = NOW()
         WHERE subscriber_id = $5 AND handle = $6 AND post_url = $7"
    );
    sqlx::query(&sql)
        .bind(media_type)
        .bind(views)
        .bind(likes)
        .bind(comments)
        .bind(subscriber_id)
        .bind(handle)
        .bind(post_url)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_snapshots(
    pool: &PgPool,
    subscriber_id: i64,
    handle: &str,
    post_url: &str,
) -> Result<Option<PostSnapshot>> {
    let row = sqlx::query_as::<_, PostSnapshot>(
        "SELECT subscriber_id, handle, post_url, media_type, posted_at,
                d1_at, d1_views, d1_likes, d1_comments,
                d3_at, d3_views, d3_likes, d3_comments,
                d7_at, d7_views, d7_likes, d7_comments,
                d21_at, d21_views, d21_likes, d21_comments
         FROM post_snapshots
         WHERE subscriber_id = $1 AND handle = $2 AND post_url = $3",
    )
    .bind(subscriber_id)
    .bind(handle)
    .bind(post_url)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Metric-per-day values for the post's peer pool at one checkpoint.
///
/// The pool is every snapshot of the same `(subscriber, handle)` with any
/// observation at that checkpoint and a loosely matching media type. It
/// is computed fresh on every classification.
pub async fn velocity_pool(
    pool: &PgPool,
    subscriber_id: i64,
    handle: &str,
    media_type: &str,
    checkpoint: Checkpoint,
) -> Result<Vec<f64>> {
    let (_, v_col, l_col, c_col) = checkpoint.snapshot_columns();
    let sql = format!(
        "SELECT {v_col} AS v, {l_col} AS l, {c_col} AS c, media_type
         FROM post_snapshots
         WHERE subscriber_id = $1
           AND handle = $2
           AND ({v_col} IS NOT NULL OR {l_col} IS NOT NULL OR {c_col} IS NOT NULL)"
    );
    let rows: Vec<(Option<i32>, Option<i32>, Option<i32>, Option<String>)> = sqlx::query_as(&sql)
        .bind(subscriber_id)
        .bind(handle)
        .fetch_all(pool)
        .await?;

    let days = checkpoint.days();
    let mut values = Vec::with_capacity(rows.len());
    for (v, l, c, row_media) in rows {
        let row_media = row_media.unwrap_or_default();
        if !crate::velocity::media_type_matches(media_type, &row_media) {
            continue;
        }
        values.push(metric_value(&row_media, v, l, c) / days);
    }
    Ok(values)
}

/// Upsert the user-visible classification for one post. Last write wins.
#[allow(clippy::too_many_arguments)]
pub async fn upsert_post_signal(
    pool: &PgPool,
    subscriber_id: i64,
    handle: &str,
    post_url: &str,
    media_type: Option<&str>,
    posted_at: Option<DateTime<Utc>>,
    caption: Option<&str>,
    velocity_tag: &str,
    velocity_stage: &str,
    velocity_percentile: &str,
) -> Result<()> {
    let feed_id = get_feed_id(pool, subscriber_id).await?;
    let feeder_id = get_feeder_id(pool, feed_id, handle).await?;

    sqlx::query(
        "INSERT INTO post_signals (
            subscriber_id, feed_id, feeder_id, handle, post_url, media_type, posted_at, caption,
            velocity_tag, velocity_stage, velocity_percentile, updated_at
         )
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW())
         ON CONFLICT (subscriber_id, handle, post_url)
         DO UPDATE SET
            feed_id = EXCLUDED.feed_id,
            feeder_id = EXCLUDED.feeder_id,
            media_type = EXCLUDED.media_type,
            posted_at = COALESCE(EXCLUDED.posted_at, post_signals.posted_at),
            caption = EXCLUDED.caption,
            velocity_tag = EXCLUDED.velocity_tag,
            velocity_stage = EXCLUDED.velocity_stage,
            velocity_percentile = EXCLUDED.velocity_percentile,
            updated_at = NOW()",
    )
    .bind(subscriber_id)
    .bind(feed_id)
    .bind(feeder_id)
    .bind(handle)
    .bind(post_url)
    .bind(media_type)
    .bind(posted_at)
    .bind(caption)
    .bind(velocity_tag)
    .bind(velocity_stage)
    .bind(velocity_percentile)
    .execute(pool)
    .await?;
    Ok(())
}

/// One idempotent metric row per `(post, checkpoint)`.
#[derive(Debug, Clone)]
pub struct CheckpointMetric<'a> {
    pub checkpoint: Checkpoint,
    pub stage_label: &'a str,
    pub media_type: Option<&'a str>,
    pub views: Option<i32>,
    pub likes: Option<i32>,
    pub comments: Option<i32>,
    pub metric_value: Option<f64>,
    pub velocity_value: Option<f64>,
    pub velocity_tag: &'a str,
    pub velocity_percentile: &'a str,
    pub perf_score: Option<&'a str>,
}

pub async fn upsert_checkpoint_metric(
    pool: &PgPool,
    subscriber_id: i64,
    handle: &str,
    post_url: &str,
    metric: CheckpointMetric<'_>,
) -> Result<()> {
    let feed_id = get_feed_id(pool, subscriber_id).await?;
    let feeder_id = get_feeder_id(pool, feed_id, handle).await?;

    sqlx::query(
        "INSERT INTO post_checkpoint_metrics (
            subscriber_id, feed_id, feeder_id, handle, post_url, checkpoint, checkpoint_at,
            stage_label, media_type, views, likes, comments, metric_value, velocity_value,
            velocity_tag, velocity_percentile, perf_score, created_at
         )
         VALUES ($1, $2, $3, $4, $5, $6, NOW(), $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, NOW())
         ON CONFLICT (subscriber_id, handle, post_url, checkpoint)
         DO UPDATE SET
            feed_id = EXCLUDED.feed_id,
            feeder_id = EXCLUDED.feeder_id,
            checkpoint_at = NOW(),
            stage_label = EXCLUDED.stage_label,
            media_type = EXCLUDED.media_type,
            views = EXCLUDED.views,
            likes = EXCLUDED.likes,
            comments = EXCLUDED.comments,
            metric_value = EXCLUDED.metric_value,
            velocity_value = EXCLUDED.velocity_value,
            velocity_tag = EXCLUDED.velocity_tag,
            velocity_percentile = EXCLUDED.velocity_percentile,
            perf_score = EXCLUDED.perf_score",
    )
    .bind(subscriber_id)
    .bind(feed_id)
    .bind(feeder_id)
    .bind(handle)
    .bind(post_url)
    .bind(metric.checkpoint.as_str())
    .bind(metric.stage_label)
    .bind(metric.media_type)
    .bind(metric.views)
    .bind(metric.likes)
    .bind(metric.comments)
    .bind(metric.metric_value)
    .bind(metric.velocity_value)
    .bind(metric.velocity_tag)
    .bind(metric.velocity_percentile)
    .bind(metric.perf_score)
    .execute(pool)
    .await?;
    Ok(())
}

/// Whether the stored signal for a post is hot (🔥 or 🚀), as consulted by
/// the D21 gate.
pub async fn is_d7_hot(
    pool: &PgPool,
    subscriber_id: i64,
    handle: &str,
    post_url: &str,
) -> Result<bool> {
    let row: Option<(Option<String>,)> = sqlx::query_as(
        "SELECT velocity_tag
         FROM post_signals
         WHERE subscriber_id = $1 AND handle = $2 AND post_url = $3
         LIMIT 1",
    )
    .bind(subscriber_id)
    .bind(handle)
    .bind(post_url)
    .fetch_optional(pool)
    .await?;
    Ok(row
        .and_then(|(tag,)| tag)
        .is_some_and(|tag| crate::velocity::is_hot_tag(&tag)))
}

/// Signal fields for every post of a handle, keyed by post-URL shortcode.
///
/// Handle matching ignores a leading `@` and case, so sheet tab names and
/// scraped owner names land on the same rows.
pub async fn get_post_signal_map(
    pool: &PgPool,
    subscriber_id: i64,
    handle: &str,
) -> Result<HashMap<String, PostSignalFields>> {
    let rows = sqlx::query_as::<_, PostSignalFields>(
        "SELECT post_url, velocity_tag, velocity_percentile, velocity_stage
         FROM post_signals
         WHERE subscriber_id = $1
           AND lower(regexp_replace(handle, '^@', '')) = lower(regexp_replace($2, '^@', ''))",
    )
    .bind(subscriber_id)
    .bind(handle)
    .fetch_all(pool)
    .await?;

    let mut map = HashMap::new();
    for row in rows {
        let key = shortcode_from_url(&row.post_url);
        if key.is_empty() {
            continue;
        }
        map.insert(key, row);
    }
    Ok(map)
}

/// Most recent followers sample for a handle, used as the perf-score
/// baseline for image and carousel posts.
pub async fn latest_followers(
    pool: &PgPool,
    subscriber_id: i64,
    handle: &str,
) -> Result<Option<i64>> {
    let row: Option<(Option<i64>,)> = sqlx::query_as(
        "SELECT followers_count
         FROM handle_profile_metrics
         WHERE subscriber_id = $1 AND handle = $2
         ORDER BY sampled_at DESC
         LIMIT 1",
    )
    .bind(subscriber_id)
    .bind(handle)
    .fetch_optional(pool)
    .await?;
    Ok(row.and_then(|(count,)| count))
}

/// Weekly profile refresh payload.
#[derive(Debug, Clone, Default)]
pub struct HandleProfile {
    pub profile_url: Option<String>,
    pub full_name: Option<String>,
    pub business_category: Option<String>,
    pub biography: Option<String>,
    pub followers_count: Option<i64>,
    pub follows_count: Option<i64>,
    pub posts_count: Option<i64>,
    pub verified: Option<bool>,
    pub profile_pic_url: Option<String>,
}

pub async fn upsert_handle_profile_metric(
    pool: &PgPool,
    subscriber_id: i64,
    handle: &str,
    profile: &HandleProfile,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO handle_profile_metrics (
            subscriber_id, handle, profile_url, full_name, business_category, biography,
            followers_count, follows_count, posts_count, verified, profile_pic_url, sampled_at, created_at
         )
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW(), NOW())
         ON CONFLICT (subscriber_id, handle)
         DO UPDATE SET
            profile_url = EXCLUDED.profile_url,
            full_name = EXCLUDED.full_name,
            business_category = EXCLUDED.business_category,
            biography = EXCLUDED.biography,
            followers_count = EXCLUDED.followers_count,
            follows_count = EXCLUDED.follows_count,
            posts_count = EXCLUDED.posts_count,
            verified = EXCLUDED.verified,
            profile_pic_url = EXCLUDED.profile_pic_url,
            sampled_at = NOW()",
    )
    .bind(subscriber_id)
    .bind(handle)
    .bind(&profile.profile_url)
    .bind(&profile.full_name)
    .bind(&profile.business_category)
    .bind(&profile.biography)
    .bind(profile.followers_count)
    .bind(profile.follows_count)
    .bind(profile.posts_count)
    .bind(profile.verified)
    .bind(&profile.profile_pic_url)
    .execute(pool)
    .await?;
    Ok(())
}

/// Record a handle's most recent sync outcome.
pub async fn upsert_handle_state(
    pool: &PgPool,
    subscriber_id: i64,
    handle: &str,
    sheet_name: &str,
    status: &str,
    last_seen_post_id: Option<&str>,
    last_error: Option<&str>,
) -> Result<()> {
    let last_success_at = (status == "success").then(Utc::now);
    sqlx::query(
        "INSERT INTO handle_state (subscriber_id, handle, sheet_name, last_success_at, last_seen_post_id, last_status, last_error, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
         ON CONFLICT (subscriber_id, handle)
         DO UPDATE SET
            sheet_name = EXCLUDED.sheet_name,
            last_success_at = COALESCE(EXCLUDED.last_success_at, handle_state.last_success_at),
            last_seen_post_id = EXCLUDED.last_seen_post_id,
            last_status = EXCLUDED.last_status,
            last_error = EXCLUDED.last_error,
            updated_at = NOW()",
    )
    .bind(subscriber_id)
    .bind(handle)
    .bind(sheet_name)
    .bind(last_success_at)
    .bind(last_seen_post_id)
    .bind(last_error.map(truncate_error))
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn log_run_start(
    pool: &PgPool,
    subscriber_id: i64,
    spreadsheet_id: &str,
    handle: &str,
    run_type: &str,
) -> Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO run_log (subscriber_id, spreadsheet_id, handle, run_type, status)
         VALUES ($1, $2, $3, $4, 'running')
         RETURNING id",
    )
    .bind(subscriber_id)
    .bind(spreadsheet_id)
    .bind(handle)
    .bind(run_type)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

pub async fn log_run_finish(
    pool: &PgPool,
    run_log_id: i64,
    status: &str,
    apify_items_returned: i32,
    posts_upserted_count: i32,
    posts_updated_count: i32,
    last_error: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE run_log
         SET status = $2,
             apify_items_returned = $3,
             posts_upserted_count = $4,
             posts_updated_count = $5,
             last_error = $6,
             finished_at = NOW()
         WHERE id = $1",
    )
    .bind(run_log_id)
    .bind(status)
    .bind(apify_items_returned)
    .bind(posts_upserted_count)
    .bind(posts_updated_count)
    .bind(last_error.map(truncate_error))
    .execute(pool)
    .await?;
    Ok(())
}
