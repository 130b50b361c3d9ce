//! Retention policy: drop aged run logs, signals, embeddings, snapshots,
//! and expired alert events.

use crate::error::Result;
use sqlx::PgPool;
use tracing::info;

pub async fn run_retention_cleanup(pool: &PgPool) -> Result<()> {
    let run_logs = sqlx::query("DELETE FROM run_log WHERE started_at < NOW() - INTERVAL '90 days'")
        .execute(pool)
        .await?
        .rows_affected();
    let signals =
        sqlx::query("DELETE FROM post_signals WHERE updated_at < NOW() - INTERVAL '12 months'")
            .execute(pool)
            .await?
            .rows_affected();
    let embeddings =
        sqlx::query("DELETE FROM post_embeddings WHERE updated_at < NOW() - INTERVAL '12 months'")
            .execute(pool)
            .await?
            .rows_affected();
    let snapshots =
        sqlx::query("DELETE FROM post_snapshots WHERE updated_at < NOW() - INTERVAL '12 months'")
            .execute(pool)
            .await?
            .rows_affected();
    let alert_events = sqlx::query(
        "DELETE FROM alert_events
         WHERE COALESCE(expires_at, created_at + INTERVAL '7 days') < NOW()",
    )
    .execute(pool)
    .await?
    .rows_affected();

    info!(
        run_logs,
        signals, embeddings, snapshots, alert_events, "retention cleanup complete"
    );
    Ok(())
}
