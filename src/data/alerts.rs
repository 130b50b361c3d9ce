//! Alert candidate persistence: deduplicated inserts, recent-type
//! lookups, and per-feed scan watermarks.

use crate::error::Result;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use std::collections::HashSet;

/// Daily dedupe key for an alert candidate.
///
/// `sha256("{feed_id}|{feeder_id or 0}|{alert_type}|{trim(lower(title))}|{YYYY-MM-DD}")`
pub fn dedupe_key(
    feed_id: i64,
    feeder_id: Option<i64>,
    alert_type: &str,
    title: &str,
    day: DateTime<Utc>,
) -> String {
    let base = format!(
        "{}|{}|{}|{}|{}",
        feed_id,
        feeder_id.unwrap_or(0),
        alert_type,
        title.trim().to_lowercase(),
        day.format("%Y-%m-%d"),
    );
    let digest = Sha256::digest(base.as_bytes());
    format!("{digest:x}")
}

/// A fully scored candidate ready for insertion.
#[derive(Debug, Clone)]
pub struct NewAlertCandidate {
    pub feed_id: i64,
    pub feeder_id: Option<i64>,
    pub ui_tab: String,
    pub alert_category: String,
    pub alert_color: String,
    pub alert_urgency: String,
    pub alert_family: String,
    pub alert_type: String,
    pub priority_score: f64,
    pub impact_score: f64,
    pub confidence_score: f64,
    pub freshness_score: f64,
    pub novelty_score: f64,
    pub actionability_score: f64,
    pub title: String,
    pub body: String,
    pub payload: serde_json::Value,
}

/// Conditionally insert a candidate.
///
/// Two guards: the partial unique index on `(feed_id, alert_dedupe_key)`,
/// and a 24-hour `NOT EXISTS` over `(feed_id, feeder_id, alert_type,
/// title)` for rows still alive (candidate/selected/sent). Either guard
/// silently drops the insert.
pub async fn upsert_alert_candidate(pool: &PgPool, candidate: &NewAlertCandidate) -> Result<()> {
    let key = dedupe_key(
        candidate.feed_id,
        candidate.feeder_id,
        &candidate.alert_type,
        &candidate.title,
        Utc::now(),
    );

    sqlx::query(
        "INSERT INTO alert_candidates (
            feed_id, feeder_id, ui_tab, alert_category, alert_color, alert_urgency,
            alert_dedupe_key, alert_family, alert_type, priority_score,
            impact_score, confidence_score, freshness_score, novelty_score,
            actionability_score, title, body, payload, status, created_at
         )
         SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, 'candidate', NOW()
         WHERE NOT EXISTS (
            SELECT 1
            FROM alert_candidates ac
            WHERE ac.feed_id = $1
              AND COALESCE(ac.feeder_id, 0) = COALESCE($2, 0)
              AND ac.alert_type = $9
              AND ac.title = $16
              AND ac.created_at >= NOW() - INTERVAL '24 hours'
              AND ac.status IN ('candidate', 'selected', 'sent')
         )
         ON CONFLICT (feed_id, alert_dedupe_key) WHERE alert_dedupe_key <> '' DO NOTHING",
    )
    .bind(candidate.feed_id)
    .bind(candidate.feeder_id)
    .bind(&candidate.ui_tab)
    .bind(&candidate.alert_category)
    .bind(&candidate.alert_color)
    .bind(&candidate.alert_urgency)
    .bind(&key)
    .bind(&candidate.alert_family)
    .bind(&candidate.alert_type)
    .bind(candidate.priority_score)
    .bind(candidate.impact_score)
    .bind(candidate.confidence_score)
    .bind(candidate.freshness_score)
    .bind(candidate.novelty_score)
    .bind(candidate.actionability_score)
    .bind(&candidate.title)
    .bind(&candidate.body)
    .bind(&candidate.payload)
    .execute(pool)
    .await?;
    Ok(())
}

/// Alert types already emitted for a feed in the trailing window, across
/// both the legacy per-subscriber event table and the candidate table.
pub async fn recent_alert_types(pool: &PgPool, feed_id: i64, hours: i32) -> Result<HashSet<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT alert_type
         FROM alert_events
         WHERE subscriber_id = (SELECT subscriber_id FROM feeds WHERE id = $1)
           AND created_at >= NOW() - make_interval(hours => $2)
         UNION
         SELECT alert_type
         FROM alert_candidates
         WHERE feed_id = $1
           AND created_at >= NOW() - make_interval(hours => $2)",
    )
    .bind(feed_id)
    .bind(hours)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(t,)| t).collect())
}

/// Per-feed scan watermarks.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AlertEngineState {
    pub feed_id: i64,
    pub last_hot_scan_at: Option<DateTime<Utc>>,
    pub last_pattern_scan_at: Option<DateTime<Utc>>,
}

pub async fn get_or_init_engine_state(pool: &PgPool, feed_id: i64) -> Result<AlertEngineState> {
    let row = sqlx::query_as::<_, AlertEngineState>(
        "INSERT INTO alert_engine_state (feed_id, created_at, updated_at)
         VALUES ($1, NOW(), NOW())
         ON CONFLICT (feed_id) DO UPDATE SET updated_at = NOW()
         RETURNING feed_id, last_hot_scan_at, last_pattern_scan_at",
    )
    .bind(feed_id)
    .fetch_one(pool)
    .await?;
    Ok(row)
}

pub async fn mark_engine_scan(
    pool: &PgPool,
    feed_id: i64,
    hot_scan_at: Option<DateTime<Utc>>,
    pattern_scan_at: Option<DateTime<Utc>>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO alert_engine_state (feed_id, last_hot_scan_at, last_pattern_scan_at, created_at, updated_at)
         VALUES ($1, $2, $3, NOW(), NOW())
         ON CONFLICT (feed_id)
         DO UPDATE SET
            last_hot_scan_at = COALESCE(EXCLUDED.last_hot_scan_at, alert_engine_state.last_hot_scan_at),
            last_pattern_scan_at = COALESCE(EXCLUDED.last_pattern_scan_at, alert_engine_state.last_pattern_scan_at),
            updated_at = NOW()",
    )
    .bind(feed_id)
    .bind(hot_scan_at)
    .bind(pattern_scan_at)
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn dedupe_key_is_stable_and_normalized() {
        let day = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap();
        let a = dedupe_key(7, Some(3), "velocity_spike", "  Spike On @acme ", day);
        let b = dedupe_key(7, Some(3), "velocity_spike", "spike on @acme", day);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn dedupe_key_treats_missing_feeder_as_zero() {
        let day = Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).unwrap();
        assert_eq!(
            dedupe_key(7, None, "timing_gap", "t", day),
            dedupe_key(7, Some(0), "timing_gap", "t", day)
        );
    }

    #[test]
    fn dedupe_key_varies_by_day() {
        let d1 = Utc.with_ymd_and_hms(2026, 8, 1, 23, 59, 0).unwrap();
        let d2 = Utc.with_ymd_and_hms(2026, 8, 2, 0, 1, 0).unwrap();
        assert_ne!(
            dedupe_key(7, None, "x", "t", d1),
            dedupe_key(7, None, "x", "t", d2)
        );
    }
}
