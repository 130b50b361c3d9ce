//! Alert candidate engine.
//!
//! Per feed, three candidate streams (velocity, intelligence, and, for
//! anchor-mode feeds, competitive) scan recent checkpoint metrics,
//! signal aggregates, pair metrics, and embeddings. Candidates are
//! ranked by a weighted priority, truncated per feed, and inserted with
//! daily dedupe keys; alert types already emitted in the last 24 hours
//! are suppressed at generation time.

use crate::data::alerts::{
    NewAlertCandidate, get_or_init_engine_state, mark_engine_scan, recent_alert_types,
    upsert_alert_candidate,
};
use crate::data::embeddings::list_recent_embeddings;
use crate::data::feeds::list_feeds;
use crate::error::Result;
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::{Value, json};
use sqlx::PgPool;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// Cosine similarity floor for the mimicry scan.
const MIMICRY_SIMILARITY_FLOOR: f64 = 0.93;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertCategory {
    Velocity,
    Competitive,
    Intelligence,
}

impl AlertCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertCategory::Velocity => "velocity",
            AlertCategory::Competitive => "competitive",
            AlertCategory::Intelligence => "intelligence",
        }
    }

    pub fn color(&self) -> &'static str {
        match self {
            AlertCategory::Velocity => "#CCFF00",
            AlertCategory::Competitive => "#FF2D8A",
            AlertCategory::Intelligence => "#39A8FF",
        }
    }
}

/// A scored candidate before persistence.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub feeder_id: Option<i64>,
    pub category: AlertCategory,
    pub urgency: &'static str,
    pub alert_type: &'static str,
    pub impact: f64,
    pub confidence: f64,
    pub freshness: f64,
    pub novelty: f64,
    pub actionability: f64,
    pub title: String,
    pub body: String,
    pub payload: Value,
}

impl Candidate {
    /// Weighted priority over the five component scores.
    pub fn priority(&self) -> f64 {
        self.impact * 0.35
            + self.confidence * 0.25
            + self.freshness * 0.20
            + self.novelty * 0.10
            + self.actionability * 0.10
    }
}

pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom <= 0.0 { 0.0 } else { dot / denom }
}

/// Run the engine for every active feed (optionally one subscriber's).
/// Returns candidates created per feed.
pub async fn generate_alert_candidates(
    pool: &PgPool,
    subscriber_id: Option<i64>,
    max_per_feed: usize,
) -> Result<HashMap<i64, usize>> {
    let feeds = list_feeds(pool).await?;
    let mut created = HashMap::new();

    for feed in feeds
        .iter()
        .filter(|f| subscriber_id.is_none_or(|id| f.subscriber_id == id))
    {
        let scan_started_at = Utc::now();
        let state = get_or_init_engine_state(pool, feed.id).await?;
        let hot_since = state
            .last_hot_scan_at
            .unwrap_or(scan_started_at - TimeDelta::hours(24));
        let pattern_since = state
            .last_pattern_scan_at
            .unwrap_or(scan_started_at - TimeDelta::hours(24));

        let recent = recent_alert_types(pool, feed.id, 24).await?;

        let mut candidates = velocity_candidates(pool, feed.id, &recent, hot_since).await?;
        candidates.extend(intelligence_candidates(pool, feed.id, &recent, pattern_since).await?);
        if feed.mode == "anchor" {
            candidates.extend(competitive_candidates(pool, feed.id, &recent, pattern_since).await?);
        }

        candidates.sort_by(|a, b| {
            b.priority()
                .partial_cmp(&a.priority())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(max_per_feed);

        for candidate in &candidates {
            upsert_alert_candidate(
                pool,
                &NewAlertCandidate {
                    feed_id: feed.id,
                    feeder_id: candidate.feeder_id,
                    ui_tab: "flags".to_string(),
                    alert_category: candidate.category.as_str().to_string(),
                    alert_color: candidate.category.color().to_string(),
                    alert_urgency: candidate.urgency.to_string(),
                    alert_family: candidate.category.as_str().to_string(),
                    alert_type: candidate.alert_type.to_string(),
                    priority_score: candidate.priority(),
                    impact_score: candidate.impact,
                    confidence_score: candidate.confidence,
                    freshness_score: candidate.freshness,
                    novelty_score: candidate.novelty,
                    actionability_score: candidate.actionability,
                    title: candidate.title.clone(),
                    body: candidate.body.clone(),
                    payload: candidate.payload.clone(),
                },
            )
            .await?;
        }

        info!(
            feed_id = feed.id,
            mode = %feed.mode,
            candidates = candidates.len(),
            "alert scan complete"
        );
        created.insert(feed.id, candidates.len());
        mark_engine_scan(pool, feed.id, Some(scan_started_at), Some(scan_started_at)).await?;
    }
    Ok(created)
}

#[derive(Debug, sqlx::FromRow)]
struct HotPostRow {
    feeder_id: Option<i64>,
    handle: String,
    post_url: String,
    velocity_tag: Option<String>,
    velocity_stage: Option<String>,
    velocity_percentile: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct DecayRow {
    feeder_id: Option<i64>,
    handle: String,
    post_url: String,
    v1: f64,
    v2: f64,
}

#[derive(Debug, sqlx::FromRow)]
struct RecordRow {
    feeder_id: Option<i64>,
    handle: String,
    post_url: String,
    metric_value: f64,
}

#[derive(Debug, sqlx::FromRow)]
struct FormatWinRow {
    feeder_id: Option<i64>,
    handle: String,
    media_type: String,
    avg_velocity: f64,
}

/// Velocity stream: spikes, momentum drops, personal records, format wins.
async fn velocity_candidates(
    pool: &PgPool,
    feed_id: i64,
    recent: &HashSet<String>,
    hot_since: DateTime<Utc>,
) -> Result<Vec<Candidate>> {
    let mut out = Vec::new();

    if !recent.contains("velocity_spike") {
        // Latest observation per post; hot when at/above the 30-day p80 for
        // its (media_type, checkpoint), or already ranked in the top 20%.
        let hot = sqlx::query_as::<_, HotPostRow>(
            "WITH thresholds AS (
               SELECT COALESCE(pcm.media_type, core.media_type, 'Unknown') AS media_type,
                      pcm.checkpoint,
                      percentile_cont(0.80) WITHIN GROUP (ORDER BY pcm.velocity_value) AS p80
               FROM post_checkpoint_metrics pcm
               LEFT JOIN posts_core core
                 ON core.subscriber_id = pcm.subscriber_id
                AND core.handle = pcm.handle
                AND core.post_url = pcm.post_url
               WHERE pcm.feed_id = $1
                 AND pcm.checkpoint_at >= NOW() - INTERVAL '30 days'
                 AND pcm.velocity_value IS NOT NULL
               GROUP BY 1, 2
             ),
             latest AS (
               SELECT DISTINCT ON (pcm.feeder_id, pcm.post_url)
                 pcm.feeder_id,
                 pcm.handle,
                 pcm.post_url,
                 pcm.checkpoint,
                 pcm.checkpoint_at,
                 COALESCE(pcm.media_type, core.media_type, 'Unknown') AS media_type,
                 pcm.velocity_value,
                 COALESCE(ps.velocity_tag, pcm.velocity_tag) AS velocity_tag,
                 COALESCE(ps.velocity_stage, UPPER(pcm.checkpoint)) AS velocity_stage,
                 COALESCE(ps.velocity_percentile, pcm.velocity_percentile) AS velocity_percentile
               FROM post_checkpoint_metrics pcm
               LEFT JOIN posts_core core
                 ON core.subscriber_id = pcm.subscriber_id
                AND core.handle = pcm.handle
                AND core.post_url = pcm.post_url
               LEFT JOIN post_signals ps
                 ON ps.subscriber_id = pcm.subscriber_id
                AND ps.handle = pcm.handle
                AND ps.post_url = pcm.post_url
               WHERE pcm.feed_id = $1
                 AND pcm.checkpoint_at > $2
                 AND pcm.velocity_value IS NOT NULL
               ORDER BY pcm.feeder_id, pcm.post_url, pcm.checkpoint_at DESC
             )
             SELECT l.feeder_id, l.handle, l.post_url, l.velocity_tag, l.velocity_stage,
                    l.velocity_percentile
             FROM latest l
             LEFT JOIN thresholds t
               ON t.media_type = l.media_type AND t.checkpoint = l.checkpoint
             WHERE (t.p80 IS NOT NULL AND l.velocity_value >= t.p80)
                OR (l.velocity_percentile ~ '^[0-9]{1,3}%$'
                    AND regexp_replace(l.velocity_percentile, '[^0-9]', '', 'g')::INT <= 20)
             ORDER BY l.checkpoint_at DESC, l.velocity_value DESC
             LIMIT 10",
        )
        .bind(feed_id)
        .bind(hot_since)
        .fetch_all(pool)
        .await?;

        if let Some(row) = hot.first() {
            let tag = row.velocity_tag.clone().unwrap_or_else(|| "🔥".to_string());
            let stage = row
                .velocity_stage
                .clone()
                .unwrap_or_else(|| "latest".to_string());
            let percentile = row
                .velocity_percentile
                .clone()
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| "n/a".to_string());
            out.push(Candidate {
                feeder_id: row.feeder_id,
                category: AlertCategory::Velocity,
                urgency: "now",
                alert_type: "velocity_spike",
                impact: 0.9,
                confidence: 0.8,
                freshness: 0.95,
                novelty: 0.75,
                actionability: 0.9,
                title: format!("Velocity spike on {}", row.handle),
                body: format!("{tag} at {stage} ({percentile}). Act in next 12h."),
                payload: json!({"post_url": row.post_url, "handle": row.handle}),
            });
        }
    }

    if !recent.contains("momentum_drop") {
        let decay = sqlx::query_as::<_, DecayRow>(
            "WITH d1 AS (
               SELECT feeder_id, handle, post_url, velocity_value AS v1
               FROM post_checkpoint_metrics
               WHERE feed_id = $1 AND checkpoint = 'd1'
             ),
             d2 AS (
               SELECT feeder_id, post_url, velocity_value AS v2
               FROM post_checkpoint_metrics
               WHERE feed_id = $1 AND checkpoint = 'd2'
             )
             SELECT d1.feeder_id, d1.handle, d1.post_url, d1.v1, d2.v2
             FROM d1
             JOIN d2 ON d1.feeder_id = d2.feeder_id AND d1.post_url = d2.post_url
             WHERE d1.v1 > 0 AND d2.v2 > 0 AND d2.v2 <= d1.v1 * 0.6
             ORDER BY (d1.v1 - d2.v2) DESC
             LIMIT 3",
        )
        .bind(feed_id)
        .fetch_all(pool)
        .await?;

        for row in decay {
            let drop_pct = (((row.v1 - row.v2) / row.v1) * 100.0).round() as i64;
            out.push(Candidate {
                feeder_id: row.feeder_id,
                category: AlertCategory::Velocity,
                urgency: "today",
                alert_type: "momentum_drop",
                impact: 0.78,
                confidence: 0.85,
                freshness: 0.82,
                novelty: 0.7,
                actionability: 0.7,
                title: format!("Momentum drop on {}", row.handle),
                body: format!("Velocity fell {drop_pct}% from D1 to D2. Rework format before boosting."),
                payload: json!({
                    "post_url": row.post_url,
                    "handle": row.handle,
                    "drop_pct": drop_pct,
                }),
            });
        }
    }

    if !recent.contains("personal_record") {
        let record = sqlx::query_as::<_, RecordRow>(
            "WITH recent_window AS (
               SELECT feeder_id, handle, post_url, metric_value,
                      ROW_NUMBER() OVER (PARTITION BY feeder_id ORDER BY metric_value DESC) AS rk
               FROM post_checkpoint_metrics
               WHERE feed_id = $1
                 AND checkpoint IN ('d0', 'd1')
                 AND checkpoint_at >= NOW() - INTERVAL '30 days'
                 AND metric_value IS NOT NULL
             )
             SELECT feeder_id, handle, post_url, metric_value
             FROM recent_window
             WHERE rk = 1
             ORDER BY metric_value DESC
             LIMIT 1",
        )
        .bind(feed_id)
        .fetch_optional(pool)
        .await?;

        if let Some(row) = record {
            out.push(Candidate {
                feeder_id: row.feeder_id,
                category: AlertCategory::Velocity,
                urgency: "today",
                alert_type: "personal_record",
                impact: 0.86,
                confidence: 0.8,
                freshness: 0.75,
                novelty: 0.8,
                actionability: 0.65,
                title: format!("Personal record on {}", row.handle),
                body: "Highest day-one metric in 30 days. Replicate this format in next 48h."
                    .to_string(),
                payload: json!({
                    "post_url": row.post_url,
                    "handle": row.handle,
                    "metric_value": row.metric_value,
                }),
            });
        }
    }

    if !recent.contains("format_win") {
        let win = sqlx::query_as::<_, FormatWinRow>(
            "SELECT pcm.feeder_id, pcm.handle,
                    COALESCE(core.media_type, 'Unknown') AS media_type,
                    AVG(pcm.velocity_value)::FLOAT8 AS avg_velocity
             FROM post_checkpoint_metrics pcm
             LEFT JOIN posts_core core
               ON core.subscriber_id = pcm.subscriber_id
              AND core.handle = pcm.handle
              AND core.post_url = pcm.post_url
             WHERE pcm.feed_id = $1
               AND pcm.checkpoint IN ('d1', 'd2', 'd3')
               AND pcm.checkpoint_at >= NOW() - INTERVAL '14 days'
               AND pcm.velocity_value IS NOT NULL
             GROUP BY pcm.feeder_id, pcm.handle, COALESCE(core.media_type, 'Unknown')
             HAVING COUNT(*) >= 3
             ORDER BY avg_velocity DESC
             LIMIT 1",
        )
        .bind(feed_id)
        .fetch_optional(pool)
        .await?;

        if let Some(row) = win {
            out.push(Candidate {
                feeder_id: row.feeder_id,
                category: AlertCategory::Velocity,
                urgency: "today",
                alert_type: "format_win",
                impact: 0.72,
                confidence: 0.7,
                freshness: 0.68,
                novelty: 0.7,
                actionability: 0.8,
                title: format!("Format win on {}", row.handle),
                body: format!("{} is leading on recent velocity.", row.media_type),
                payload: json!({
                    "handle": row.handle,
                    "media_type": row.media_type,
                    "avg_velocity": row.avg_velocity,
                }),
            });
        }
    }

    Ok(out)
}

#[derive(Debug, sqlx::FromRow)]
struct SaturationRow {
    signal_key: String,
    adoption_rate: f64,
    velocity_delta: f64,
    saturation_score: f64,
    confidence: f64,
}

#[derive(Debug, sqlx::FromRow)]
struct WaveRow {
    media_type: String,
    hot_rate: f64,
}

#[derive(Debug, sqlx::FromRow)]
struct BreakoutRow {
    feeder_id: Option<i64>,
    handle: String,
    post_url: String,
    velocity_percentile: Option<String>,
}

/// Intelligence stream: saturation fatigue, sector waves, breakout posts,
/// and embedding-based mimicry.
async fn intelligence_candidates(
    pool: &PgPool,
    feed_id: i64,
    recent: &HashSet<String>,
    pattern_since: DateTime<Utc>,
) -> Result<Vec<Candidate>> {
    let mut out = Vec::new();

    if !recent.contains("sector_fatigue") {
        let sat = sqlx::query_as::<_, SaturationRow>(
            "SELECT signal_key, adoption_rate, velocity_delta, saturation_score, confidence
             FROM signal_aggregates
             WHERE feed_id = $1
               AND signal_type = 'media_type'
               AND window_key = 'd3'
               AND saturation_score >= 0.5
               AND confidence >= 0.5
               AND updated_at > $2
             ORDER BY saturation_score DESC, adoption_rate DESC
             LIMIT 1",
        )
        .bind(feed_id)
        .bind(pattern_since)
        .fetch_optional(pool)
        .await?;

        if let Some(row) = sat {
            out.push(Candidate {
                feeder_id: None,
                category: AlertCategory::Intelligence,
                urgency: "today",
                alert_type: "sector_fatigue",
                impact: 0.8,
                confidence: row.confidence.max(0.0),
                freshness: 0.68,
                novelty: 0.78,
                actionability: 0.82,
                title: format!("Format fatigue in {}", row.signal_key),
                body: "Adoption is high but return is flattening. Rotate to a fresher format now."
                    .to_string(),
                payload: json!({
                    "signal_key": row.signal_key,
                    "adoption_rate": row.adoption_rate,
                    "velocity_delta": row.velocity_delta,
                    "saturation_score": row.saturation_score,
                }),
            });
        }
    }

    if !recent.contains("sector_wave") {
        let wave = sqlx::query_as::<_, WaveRow>(
            "WITH thresholds AS (
               SELECT COALESCE(pcm.media_type, core.media_type, 'Unknown') AS media_type,
                      pcm.checkpoint,
                      percentile_cont(0.80) WITHIN GROUP (ORDER BY pcm.velocity_value) AS p80
               FROM post_checkpoint_metrics pcm
               LEFT JOIN posts_core core
                 ON core.subscriber_id = pcm.subscriber_id
                AND core.handle = pcm.handle
                AND core.post_url = pcm.post_url
               WHERE pcm.feed_id = $1
                 AND pcm.checkpoint_at >= NOW() - INTERVAL '30 days'
                 AND pcm.velocity_value IS NOT NULL
               GROUP BY 1, 2
             ),
             recent AS (
               SELECT DISTINCT ON (pcm.feeder_id, pcm.post_url)
                 COALESCE(pcm.media_type, core.media_type, 'Unknown') AS media_type,
                 pcm.checkpoint,
                 pcm.velocity_value
               FROM post_checkpoint_metrics pcm
               LEFT JOIN posts_core core
                 ON core.subscriber_id = pcm.subscriber_id
                AND core.handle = pcm.handle
                AND core.post_url = pcm.post_url
               WHERE pcm.feed_id = $1
                 AND pcm.checkpoint_at >= NOW() - INTERVAL '7 days'
                 AND pcm.checkpoint_at > $2
                 AND pcm.velocity_value IS NOT NULL
               ORDER BY pcm.feeder_id, pcm.post_url, pcm.checkpoint_at DESC
             )
             SELECT r.media_type,
                    AVG(CASE WHEN t.p80 IS NOT NULL AND r.velocity_value >= t.p80 THEN 1 ELSE 0 END)::FLOAT8 AS hot_rate
             FROM recent r
             LEFT JOIN thresholds t
               ON t.media_type = r.media_type AND t.checkpoint = r.checkpoint
             GROUP BY r.media_type
             HAVING COUNT(*) >= 5
             ORDER BY hot_rate DESC, COUNT(*) DESC
             LIMIT 1",
        )
        .bind(feed_id)
        .bind(pattern_since)
        .fetch_optional(pool)
        .await?;

        if let Some(row) = wave {
            let hot_rate = (row.hot_rate * 100.0).round() as i64;
            out.push(Candidate {
                feeder_id: None,
                category: AlertCategory::Intelligence,
                urgency: "today",
                alert_type: "sector_wave",
                impact: 0.84,
                confidence: 0.7,
                freshness: 0.7,
                novelty: 0.8,
                actionability: 0.8,
                title: format!("Sector wave in {}", row.media_type),
                body: format!(
                    "{hot_rate}% of recent posts are high-velocity in this format. Prioritize this next."
                ),
                payload: json!({"media_type": row.media_type, "hot_rate": hot_rate}),
            });
        }
    }

    if !recent.contains("breakout_post") {
        let breakout = sqlx::query_as::<_, BreakoutRow>(
            "SELECT pcm.feeder_id, pcm.handle, pcm.post_url,
                    COALESCE(ps.velocity_percentile, pcm.velocity_percentile) AS velocity_percentile
             FROM post_checkpoint_metrics pcm
             LEFT JOIN post_signals ps
               ON ps.subscriber_id = pcm.subscriber_id
              AND ps.handle = pcm.handle
              AND ps.post_url = pcm.post_url
             WHERE pcm.feed_id = $1
               AND pcm.checkpoint_at > $2
               AND pcm.velocity_value IS NOT NULL
             ORDER BY pcm.velocity_value DESC, pcm.checkpoint_at DESC
             LIMIT 1",
        )
        .bind(feed_id)
        .bind(pattern_since)
        .fetch_optional(pool)
        .await?;

        if let Some(row) = breakout {
            let percentile = row
                .velocity_percentile
                .clone()
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| "n/a".to_string());
            out.push(Candidate {
                feeder_id: row.feeder_id,
                category: AlertCategory::Intelligence,
                urgency: "now",
                alert_type: "breakout_post",
                impact: 0.88,
                confidence: 0.75,
                freshness: 0.92,
                novelty: 0.78,
                actionability: 0.86,
                title: format!("Breakout post on {}", row.handle),
                body: format!("Rocket signal at {percentile}. Reverse engineer and test quickly."),
                payload: json!({"handle": row.handle, "post_url": row.post_url}),
            });
        }
    }

    if !recent.contains("visual_mimicry")
        && let Some(candidate) = mimicry_candidate(pool, feed_id).await?
    {
        out.push(candidate);
    }

    Ok(out)
}

/// Cross-feeder pair of recent performance embeddings with near-identical
/// vectors; the later-posted side is flagged as the mimic.
async fn mimicry_candidate(pool: &PgPool, feed_id: i64) -> Result<Option<Candidate>> {
    let rows = list_recent_embeddings(pool, feed_id, "performance_semantic", 7, 60).await?;
    let vectors: Vec<_> = rows
        .iter()
        .filter_map(|row| {
            let vector: Vec<f64> = row
                .embedding_json
                .as_array()?
                .iter()
                .filter_map(Value::as_f64)
                .collect();
            (!vector.is_empty()).then_some((row, vector))
        })
        .collect();

    let mut best: Option<(f64, &crate::data::embeddings::RecentEmbedding, &crate::data::embeddings::RecentEmbedding)> =
        None;
    for (i, (row_a, vec_a)) in vectors.iter().enumerate() {
        for (row_b, vec_b) in vectors.iter().skip(i + 1) {
            if row_a.feeder_id == row_b.feeder_id {
                continue;
            }
            let sim = cosine_similarity(vec_a, vec_b);
            if sim >= MIMICRY_SIMILARITY_FLOOR && best.as_ref().is_none_or(|(s, _, _)| sim > *s) {
                best = Some((sim, *row_a, *row_b));
            }
        }
    }

    let Some((sim, a, b)) = best else {
        return Ok(None);
    };
    // The later-posted side is the suspected mimic.
    let (source, mimic) = match (a.posted_at, b.posted_at) {
        (Some(at_a), Some(at_b)) if at_b < at_a => (b, a),
        _ => (a, b),
    };
    debug!(feed_id, similarity = sim, "mimicry pair found");

    Ok(Some(Candidate {
        feeder_id: mimic.feeder_id,
        category: AlertCategory::Competitive,
        urgency: "today",
        alert_type: "visual_mimicry",
        impact: 0.77,
        confidence: 0.7,
        freshness: 0.72,
        novelty: 0.8,
        actionability: 0.82,
        title: format!("Possible mimicry: {}", mimic.handle),
        body: format!(
            "Pattern similarity with {} is high ({:.3}). Differentiate your next creative.",
            source.handle, sim
        ),
        payload: json!({
            "source_handle": source.handle,
            "mimic_handle": mimic.handle,
            "source_post": source.post_url,
            "mimic_post": mimic.post_url,
            "similarity": (sim * 10_000.0).round() / 10_000.0,
        }),
    }))
}

#[derive(Debug, sqlx::FromRow)]
struct PairRow {
    feeder_id: i64,
    handle: String,
    velocity_delta: Option<f64>,
    perf_delta: Option<f64>,
    sample_size: i32,
}

#[derive(Debug, sqlx::FromRow)]
struct TimingGapRow {
    dow: f64,
    n: i64,
}

/// Competitive stream (anchor-mode feeds only): circle leaders and
/// posting-lane gaps.
async fn competitive_candidates(
    pool: &PgPool,
    feed_id: i64,
    recent: &HashSet<String>,
    pattern_since: DateTime<Utc>,
) -> Result<Vec<Candidate>> {
    let mut out = Vec::new();

    if !recent.contains("circle_leader") {
        let pairs = sqlx::query_as::<_, PairRow>(
            "SELECT m.feeder_id, f.handle, m.velocity_delta, m.perf_delta, m.sample_size
             FROM feeder_pair_metrics m
             JOIN feeders f ON f.id = m.feeder_id
             WHERE m.feed_id = $1
               AND m.window_days = 30
               AND m.computed_at > $2
             ORDER BY m.relation_score DESC
             LIMIT 5",
        )
        .bind(feed_id)
        .bind(pattern_since)
        .fetch_all(pool)
        .await?;

        if let Some(row) = pairs.iter().find(|p| p.sample_size >= 4) {
            let velocity_delta = row.velocity_delta.unwrap_or(0.0);
            out.push(Candidate {
                feeder_id: Some(row.feeder_id),
                category: AlertCategory::Competitive,
                urgency: "today",
                alert_type: "circle_leader",
                impact: 0.82,
                confidence: 0.72,
                freshness: 0.65,
                novelty: 0.7,
                actionability: 0.75,
                title: format!("{} is leading your circle", row.handle),
                body: format!(
                    "7-day velocity delta vs anchor: {:.2}.",
                    velocity_delta
                ),
                payload: json!({
                    "handle": row.handle,
                    "velocity_delta": velocity_delta,
                    "perf_delta": row.perf_delta.unwrap_or(0.0),
                }),
            });
        }
    }

    if !recent.contains("timing_gap") {
        let gap = sqlx::query_as::<_, TimingGapRow>(
            "SELECT EXTRACT(DOW FROM posted_at)::FLOAT8 AS dow, COUNT(*) AS n
             FROM posts_core
             WHERE subscriber_id = (SELECT subscriber_id FROM feeds WHERE id = $1)
               AND posted_at >= NOW() - INTERVAL '28 days'
             GROUP BY 1
             ORDER BY n ASC
             LIMIT 1",
        )
        .bind(feed_id)
        .fetch_optional(pool)
        .await?;

        if let Some(row) = gap {
            let dow = row.dow as i64;
            let day = match dow {
                0 => "Sunday",
                1 => "Monday",
                2 => "Tuesday",
                3 => "Wednesday",
                4 => "Thursday",
                5 => "Friday",
                6 => "Saturday",
                _ => "Unknown day",
            };
            out.push(Candidate {
                feeder_id: None,
                category: AlertCategory::Competitive,
                urgency: "today",
                alert_type: "timing_gap",
                impact: 0.68,
                confidence: 0.72,
                freshness: 0.6,
                novelty: 0.75,
                actionability: 0.8,
                title: "Posting lane is open".to_string(),
                body: format!(
                    "{day} has the lowest activity in your feed ({} posts in 28 days). Test a post there.",
                    row.n
                ),
                payload: json!({"day_of_week": dow}),
            });
        }
    }

    Ok(out)
}
