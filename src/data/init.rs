//! Schema bootstrap and legacy backfill.
//!
//! Every mode runs this on start: apply migrations, make sure the default
//! subscriber and per-subscriber feeds exist, and repair rows from older
//! schema generations that predate the feed/feeder references.

use crate::error::Result;
use sqlx::PgPool;
use tracing::{debug, info};

pub async fn init_db(pool: &PgPool, spreadsheet_id: &str) -> Result<()> {
    sqlx::migrate!().run(pool).await?;

    ensure_default_subscriber(pool, spreadsheet_id).await?;
    ensure_default_feeds(pool).await?;
    backfill_legacy_rows(pool, spreadsheet_id).await?;
    Ok(())
}

/// Register the configured spreadsheet as a subscriber on first boot.
async fn ensure_default_subscriber(pool: &PgPool, spreadsheet_id: &str) -> Result<()> {
    if spreadsheet_id.is_empty() {
        return Ok(());
    }
    let inserted = sqlx::query(
        "INSERT INTO subscribers (name, spreadsheet_id)
         VALUES ('Default', $1)
         ON CONFLICT (spreadsheet_id) DO NOTHING",
    )
    .bind(spreadsheet_id)
    .execute(pool)
    .await?
    .rows_affected();
    if inserted > 0 {
        info!(spreadsheet_id, "default subscriber created");
    }
    Ok(())
}

/// Every active subscriber gets an active market feed.
async fn ensure_default_feeds(pool: &PgPool) -> Result<()> {
    sqlx::query(
        "INSERT INTO feeds (subscriber_id, name, mode, max_feeders, status, created_at, updated_at)
         SELECT s.id, s.name || ' Feed', 'market', 15, 'active', NOW(), NOW()
         FROM subscribers s
         WHERE s.status = 'active'
         ON CONFLICT (subscriber_id) DO NOTHING",
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Repair rows created before the current schema generation.
///
/// Older installs wrote queue/log/state rows without subscriber scoping
/// and post rows without feed/feeder references; everything is folded
/// into the default subscriber and its feed so the unique keys and the
/// aggregation layer hold.
async fn backfill_legacy_rows(pool: &PgPool, spreadsheet_id: &str) -> Result<()> {
    if spreadsheet_id.is_empty() {
        return Ok(());
    }
    let sub: Option<(i64,)> = sqlx::query_as("SELECT id FROM subscribers WHERE spreadsheet_id = $1")
        .bind(spreadsheet_id)
        .fetch_optional(pool)
        .await?;
    let Some((sub_id,)) = sub else {
        return Ok(());
    };

    sqlx::query("UPDATE handle_state SET subscriber_id = $1 WHERE subscriber_id IS NULL")
        .bind(sub_id)
        .execute(pool)
        .await?;
    sqlx::query("UPDATE run_log SET subscriber_id = $1 WHERE subscriber_id IS NULL")
        .bind(sub_id)
        .execute(pool)
        .await?;
    sqlx::query("UPDATE run_log SET spreadsheet_id = $1 WHERE spreadsheet_id IS NULL")
        .bind(spreadsheet_id)
        .execute(pool)
        .await?;

    // Feeders backfilled from the handles we have already synced.
    sqlx::query(
        "INSERT INTO feeders (feed_id, handle, role, status, created_at, updated_at, last_seen_at)
         SELECT f.id, hs.handle, 'standard', 'active', NOW(), NOW(), NOW()
         FROM handle_state hs
         JOIN feeds f ON f.subscriber_id = hs.subscriber_id
         ON CONFLICT (feed_id, handle) DO NOTHING",
    )
    .execute(pool)
    .await?;

    // Historical rows missing feed/feeder references.
    for table in ["post_signals", "post_embeddings", "post_checkpoint_metrics"] {
        let sql = format!(
            "UPDATE {table} t
             SET feed_id = f.id,
                 feeder_id = fd.id
             FROM feeds f
             JOIN feeders fd ON fd.feed_id = f.id
             WHERE t.subscriber_id = f.subscriber_id
               AND fd.handle = t.handle
               AND (t.feed_id IS NULL OR t.feeder_id IS NULL)"
        );
        let repaired = sqlx::query(&sql).execute(pool).await?.rows_affected();
        if repaired > 0 {
            debug!(table, repaired, "backfilled feed references");
        }
    }
    Ok(())
}
