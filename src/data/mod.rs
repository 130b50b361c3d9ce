//! Database access layer: connection pool, schema bootstrap, and all
//! domain operations over PostgreSQL.

pub mod aggregates;
pub mod alerts;
pub mod embeddings;
pub mod feeds;
pub mod health;
pub mod init;
pub mod models;
pub mod posts;
pub mod queue;
pub mod retention;

use crate::error::Result;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Create the shared connection pool.
pub async fn connect(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}
