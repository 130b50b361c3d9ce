//! Persistence for post embedding vectors.

use crate::data::feeds::{get_feed_id, get_feeder_id};
use crate::data::models::SignalPost;
use crate::error::Result;
use sqlx::PgPool;

/// Posts whose current signal tag is in `tags`, joined with their latest
/// checkpoint counters, newest first.
pub async fn list_signal_posts_for_embedding(
    pool: &PgPool,
    subscriber_id: i64,
    tags: &[String],
    limit: i64,
) -> Result<Vec<SignalPost>> {
    let rows = sqlx::query_as::<_, SignalPost>(
        "SELECT ps.subscriber_id, ps.feed_id, ps.feeder_id, ps.handle, ps.post_url, ps.media_type,
                ps.posted_at, ps.caption, ps.velocity_tag, ps.velocity_stage, ps.velocity_percentile,
                COALESCE(pc.views, 0) AS views,
                COALESCE(pc.likes, 0) AS likes,
                COALESCE(pc.comments, 0) AS comments
         FROM post_signals ps
         LEFT JOIN LATERAL (
            SELECT views, likes, comments
            FROM post_checkpoint_metrics pcm
            WHERE pcm.subscriber_id = ps.subscriber_id
              AND pcm.handle = ps.handle
              AND pcm.post_url = ps.post_url
            ORDER BY pcm.checkpoint_at DESC
            LIMIT 1
         ) pc ON TRUE
         WHERE ps.subscriber_id = $1
           AND ps.velocity_tag = ANY($2)
         ORDER BY ps.updated_at DESC
         LIMIT $3",
    )
    .bind(subscriber_id)
    .bind(tags)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn embedding_exists(
    pool: &PgPool,
    subscriber_id: i64,
    handle: &str,
    post_url: &str,
    embedding_model: &str,
    signal_type: &str,
) -> Result<bool> {
    let row: Option<(i32,)> = sqlx::query_as(
        "SELECT 1
         FROM post_embeddings
         WHERE subscriber_id = $1
           AND handle = $2
           AND post_url = $3
           AND embedding_model = $4
           AND signal_type = $5
         LIMIT 1",
    )
    .bind(subscriber_id)
    .bind(handle)
    .bind(post_url)
    .bind(embedding_model)
    .bind(signal_type)
    .fetch_optional(pool)
    .await?;
    Ok(row.is_some())
}

#[allow(clippy::too_many_arguments)]
pub async fn upsert_post_embedding(
    pool: &PgPool,
    subscriber_id: i64,
    handle: &str,
    post_url: &str,
    embedding_model: &str,
    signal_type: &str,
    signal_version: &str,
    metadata: serde_json::Value,
    source_text: &str,
    embedding: &[f64],
) -> Result<()> {
    let feed_id = get_feed_id(pool, subscriber_id).await?;
    let feeder_id = get_feeder_id(pool, feed_id, handle).await?;

    sqlx::query(
        "INSERT INTO post_embeddings (
            subscriber_id, feed_id, feeder_id, handle, post_url, signal_type, signal_version,
            embedding_model, embedding_dim, embedding_json, source_text, metadata_json,
            created_at, updated_at
         )
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, NOW(), NOW())
         ON CONFLICT (subscriber_id, handle, post_url, embedding_model, signal_type)
         DO UPDATE SET
            feed_id = EXCLUDED.feed_id,
            feeder_id = EXCLUDED.feeder_id,
            signal_version = EXCLUDED.signal_version,
            embedding_dim = EXCLUDED.embedding_dim,
            embedding_json = EXCLUDED.embedding_json,
            source_text = EXCLUDED.source_text,
            metadata_json = EXCLUDED.metadata_json,
            updated_at = NOW()",
    )
    .bind(subscriber_id)
    .bind(feed_id)
    .bind(feeder_id)
    .bind(handle)
    .bind(post_url)
    .bind(signal_type)
    .bind(signal_version)
    .bind(embedding_model)
    .bind(embedding.len() as i32)
    .bind(serde_json::to_value(embedding)?)
    .bind(source_text)
    .bind(metadata)
    .execute(pool)
    .await?;
    Ok(())
}

/// A recent performance-semantic embedding row for mimicry scanning,
/// carrying the post's publish time so the later side of a pair can be
/// identified.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RecentEmbedding {
    pub feeder_id: Option<i64>,
    pub handle: String,
    pub post_url: String,
    pub posted_at: Option<chrono::DateTime<chrono::Utc>>,
    pub embedding_json: serde_json::Value,
}

pub async fn list_recent_embeddings(
    pool: &PgPool,
    feed_id: i64,
    signal_type: &str,
    days: i32,
    limit: i64,
) -> Result<Vec<RecentEmbedding>> {
    let rows = sqlx::query_as::<_, RecentEmbedding>(
        "SELECT pe.feeder_id, pe.handle, pe.post_url, core.posted_at, pe.embedding_json
         FROM post_embeddings pe
         LEFT JOIN posts_core core
           ON core.subscriber_id = pe.subscriber_id
          AND core.handle = pe.handle
          AND core.post_url = pe.post_url
         WHERE pe.feed_id = $1
           AND pe.signal_type = $2
           AND pe.updated_at >= NOW() - make_interval(days => $3)
         ORDER BY pe.updated_at DESC
         LIMIT $4",
    )
    .bind(feed_id)
    .bind(signal_type)
    .bind(days)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
