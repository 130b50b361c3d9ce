#[allow(dead_code)]
mod helpers;

use feedpulse::alerts::generate_alert_candidates;
use feedpulse::data::alerts::{
    NewAlertCandidate, get_or_init_engine_state, mark_engine_scan, recent_alert_types,
    upsert_alert_candidate,
};
use sqlx::PgPool;

fn candidate(feed_id: i64, feeder_id: Option<i64>, alert_type: &str, title: &str) -> NewAlertCandidate {
    NewAlertCandidate {
        feed_id,
        feeder_id,
        ui_tab: "flags".to_string(),
        alert_category: "velocity".to_string(),
        alert_color: "#CCFF00".to_string(),
        alert_urgency: "now".to_string(),
        alert_family: "velocity".to_string(),
        alert_type: alert_type.to_string(),
        priority_score: 0.8,
        impact_score: 0.9,
        confidence_score: 0.8,
        freshness_score: 0.95,
        novelty_score: 0.75,
        actionability_score: 0.9,
        title: title.to_string(),
        body: "body".to_string(),
        payload: serde_json::json!({}),
    }
}

#[sqlx::test]
async fn duplicate_candidates_within_a_day_collapse_to_one_row(pool: PgPool) {
    let sub = helpers::insert_subscriber(&pool, "Acme", "sheet-1").await;
    let feed = helpers::insert_feed(&pool, sub, "market").await;
    let feeder = helpers::insert_feeder(&pool, feed, "@acme", "standard").await;

    // Two scans within the hour qualify the same spike.
    for _ in 0..2 {
        upsert_alert_candidate(
            &pool,
            &candidate(feed, Some(feeder), "velocity_spike", "Velocity spike on @acme"),
        )
        .await
        .unwrap();
    }

    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM alert_candidates")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[sqlx::test]
async fn title_case_and_whitespace_do_not_defeat_dedupe(pool: PgPool) {
    let sub = helpers::insert_subscriber(&pool, "Acme", "sheet-1").await;
    let feed = helpers::insert_feed(&pool, sub, "market").await;

    upsert_alert_candidate(&pool, &candidate(feed, None, "timing_gap", "Posting lane is open"))
        .await
        .unwrap();
    upsert_alert_candidate(&pool, &candidate(feed, None, "timing_gap", "  POSTING LANE IS OPEN "))
        .await
        .unwrap();

    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM alert_candidates")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[sqlx::test]
async fn distinct_titles_produce_distinct_rows(pool: PgPool) {
    let sub = helpers::insert_subscriber(&pool, "Acme", "sheet-1").await;
    let feed = helpers::insert_feed(&pool, sub, "market").await;

    upsert_alert_candidate(&pool, &candidate(feed, None, "velocity_spike", "Spike on @a"))
        .await
        .unwrap();
    upsert_alert_candidate(&pool, &candidate(feed, None, "velocity_spike", "Spike on @b"))
        .await
        .unwrap();

    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM alert_candidates")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 2);
}

#[sqlx::test]
async fn recent_types_union_candidates_and_legacy_events(pool: PgPool) {
    let sub = helpers::insert_subscriber(&pool, "Acme", "sheet-1").await;
    let feed = helpers::insert_feed(&pool, sub, "market").await;

    upsert_alert_candidate(&pool, &candidate(feed, None, "velocity_spike", "Spike"))
        .await
        .unwrap();
    sqlx::query("INSERT INTO alert_events (subscriber_id, alert_type) VALUES ($1, 'sector_wave')")
        .bind(sub)
        .execute(&pool)
        .await
        .unwrap();

    let recent = recent_alert_types(&pool, feed, 24).await.unwrap();
    assert!(recent.contains("velocity_spike"));
    assert!(recent.contains("sector_wave"));
    assert!(!recent.contains("timing_gap"));
}

#[sqlx::test]
async fn engine_state_watermarks_advance(pool: PgPool) {
    let sub = helpers::insert_subscriber(&pool, "Acme", "sheet-1").await;
    let feed = helpers::insert_feed(&pool, sub, "market").await;

    let state = get_or_init_engine_state(&pool, feed).await.unwrap();
    assert!(state.last_hot_scan_at.is_none());
    assert!(state.last_pattern_scan_at.is_none());

    let now = chrono::Utc::now();
    mark_engine_scan(&pool, feed, Some(now), None).await.unwrap();
    let state = get_or_init_engine_state(&pool, feed).await.unwrap();
    assert_eq!(state.last_hot_scan_at.map(|t| t.timestamp()), Some(now.timestamp()));
    // Absent values never regress an existing watermark.
    assert!(state.last_pattern_scan_at.is_none());

    mark_engine_scan(&pool, feed, None, Some(now)).await.unwrap();
    let state = get_or_init_engine_state(&pool, feed).await.unwrap();
    assert_eq!(state.last_hot_scan_at.map(|t| t.timestamp()), Some(now.timestamp()));
    assert_eq!(state.last_pattern_scan_at.map(|t| t.timestamp()), Some(now.timestamp()));
}

#[sqlx::test]
async fn engine_run_emits_spike_and_dedupes_across_scans(pool: PgPool) {
    let sub = helpers::insert_subscriber(&pool, "Acme", "sheet-1").await;
    let feed = helpers::insert_feed(&pool, sub, "market").await;
    let feeder = helpers::insert_feeder(&pool, feed, "@acme", "standard").await;

    // A cluster of metric rows; the strongest one is the spike candidate.
    for i in 0..6 {
        helpers::insert_checkpoint_metric(
            &pool,
            sub,
            feed,
            feeder,
            "@acme",
            &format!("https://x/p/{i}/"),
            "d1",
            "Video",
            "✅",
            1000.0 + i as f64 * 100.0,
            1000.0 + i as f64 * 100.0,
            0,
        )
        .await;
    }

    let created = generate_alert_candidates(&pool, None, 3).await.unwrap();
    assert!(created[&feed] >= 1);
    let (spikes,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM alert_candidates WHERE alert_type = 'velocity_spike'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(spikes, 1);

    // A second scan within the suppression window never repeats a type:
    // only types that lost the first ranking (if any) may appear.
    generate_alert_candidates(&pool, None, 3).await.unwrap();
    let (after,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM alert_candidates WHERE alert_type = 'velocity_spike'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(after, 1);
    let (max_per_type,): (i64,) = sqlx::query_as(
        "SELECT COALESCE(MAX(n), 0) FROM (
            SELECT COUNT(*) AS n FROM alert_candidates GROUP BY alert_type
         ) counts",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(max_per_type, 1);
}

#[sqlx::test]
async fn competitive_stream_requires_anchor_mode(pool: PgPool) {
    let sub = helpers::insert_subscriber(&pool, "Acme", "sheet-1").await;
    let feed = helpers::insert_feed(&pool, sub, "market").await;
    let feeder = helpers::insert_feeder(&pool, feed, "@acme", "standard").await;

    // Posts exist on a quiet weekday, which would qualify timing_gap in
    // anchor mode.
    sqlx::query(
        "INSERT INTO posts_core (subscriber_id, handle, post_url, posted_at)
         VALUES ($1, '@acme', 'https://x/p/a/', NOW() - INTERVAL '2 days')",
    )
    .bind(sub)
    .execute(&pool)
    .await
    .unwrap();
    let _ = feeder;

    generate_alert_candidates(&pool, None, 3).await.unwrap();
    let (gaps,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM alert_candidates WHERE alert_type = 'timing_gap'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(gaps, 0, "market-mode feeds never get competitive candidates");
}
