#[allow(dead_code)]
mod helpers;

use feedpulse::data::aggregates;
use sqlx::PgPool;

#[derive(Debug, PartialEq, sqlx::FromRow)]
struct AggRow {
    signal_type: String,
    signal_key: String,
    window_key: String,
    adoption_rate: f64,
    velocity_delta: f64,
    saturation_score: f64,
    confidence: f64,
    sample_size: i32,
}

async fn fetch_aggregates(pool: &PgPool, feed_id: i64) -> Vec<AggRow> {
    sqlx::query_as::<_, AggRow>(
        "SELECT signal_type, signal_key, window_key, adoption_rate, velocity_delta,
                saturation_score, confidence, sample_size
         FROM signal_aggregates
         WHERE feed_id = $1
         ORDER BY signal_type, signal_key, window_key",
    )
    .bind(feed_id)
    .fetch_all(pool)
    .await
    .unwrap()
}

#[sqlx::test]
async fn empty_window_produces_no_rows(pool: PgPool) {
    let sub = helpers::insert_subscriber(&pool, "Acme", "sheet-1").await;
    let feed = helpers::insert_feed(&pool, sub, "market").await;

    aggregates::rebuild_feed(&pool, feed, 30).await.unwrap();
    assert!(fetch_aggregates(&pool, feed).await.is_empty());
}

#[sqlx::test]
async fn groups_below_two_rows_are_dropped(pool: PgPool) {
    let sub = helpers::insert_subscriber(&pool, "Acme", "sheet-1").await;
    let feed = helpers::insert_feed(&pool, sub, "market").await;
    let feeder = helpers::insert_feeder(&pool, feed, "@acme", "standard").await;

    // Two videos make a group; the lone sidecar does not.
    for (i, (media, velocity)) in [("Video", 100.0), ("Video", 200.0), ("Sidecar", 50.0)]
        .into_iter()
        .enumerate()
    {
        helpers::insert_checkpoint_metric(
            &pool,
            sub,
            feed,
            feeder,
            "@acme",
            &format!("https://x/p/{i}/"),
            "d3",
            media,
            "✅",
            velocity * 3.0,
            velocity,
            0,
        )
        .await;
    }

    aggregates::rebuild_feed(&pool, feed, 30).await.unwrap();
    let rows = fetch_aggregates(&pool, feed).await;

    let media_rows: Vec<_> = rows.iter().filter(|r| r.signal_type == "media_type").collect();
    assert_eq!(media_rows.len(), 1);
    let video = media_rows[0];
    assert_eq!(video.signal_key, "Video");
    assert_eq!(video.window_key, "d3");
    assert_eq!(video.sample_size, 2);
    assert!((video.adoption_rate - 2.0 / 3.0).abs() < 1e-9);
    assert!((video.confidence - 2.0 / 15.0).abs() < 1e-9);

    // All three share the ✅ tag, so the tag dimension keeps one group of 3.
    let tag_rows: Vec<_> = rows.iter().filter(|r| r.signal_type == "velocity_tag").collect();
    assert_eq!(tag_rows.len(), 1);
    assert_eq!(tag_rows[0].sample_size, 3);
    assert!((tag_rows[0].adoption_rate - 1.0).abs() < 1e-9);
    assert!((tag_rows[0].confidence - 3.0 / 12.0).abs() < 1e-9);
}

#[sqlx::test]
async fn saturation_is_damped_for_rising_groups_and_clipped(pool: PgPool) {
    let sub = helpers::insert_subscriber(&pool, "Acme", "sheet-1").await;
    let feed = helpers::insert_feed(&pool, sub, "market").await;
    let feeder = helpers::insert_feeder(&pool, feed, "@acme", "standard").await;

    // Videos run above the blended baseline, sidecars below.
    for (i, (media, velocity)) in
        [("Video", 300.0), ("Video", 400.0), ("Sidecar", 10.0), ("Sidecar", 20.0)]
            .into_iter()
            .enumerate()
    {
        helpers::insert_checkpoint_metric(
            &pool,
            sub,
            feed,
            feeder,
            "@acme",
            &format!("https://x/p/{i}/"),
            "d7",
            media,
            "✅",
            velocity * 7.0,
            velocity,
            0,
        )
        .await;
    }

    aggregates::rebuild_feed(&pool, feed, 30).await.unwrap();
    let rows = fetch_aggregates(&pool, feed).await;

    let video = rows
        .iter()
        .find(|r| r.signal_type == "media_type" && r.signal_key == "Video")
        .unwrap();
    let sidecar = rows
        .iter()
        .find(|r| r.signal_type == "media_type" && r.signal_key == "Sidecar")
        .unwrap();

    assert!(video.velocity_delta > 0.0);
    // Rising groups are damped to half their adoption.
    assert!((video.saturation_score - video.adoption_rate * 0.5).abs() < 1e-9);
    assert!(sidecar.velocity_delta < 0.0);
    assert!((sidecar.saturation_score - sidecar.adoption_rate).abs() < 1e-9);
    for row in &rows {
        assert!(row.saturation_score >= 0.0 && row.saturation_score <= 1.0);
    }
}

#[sqlx::test]
async fn rebuild_is_idempotent_without_new_data(pool: PgPool) {
    let sub = helpers::insert_subscriber(&pool, "Acme", "sheet-1").await;
    let feed = helpers::insert_feed(&pool, sub, "market").await;
    let feeder = helpers::insert_feeder(&pool, feed, "@acme", "standard").await;

    for i in 0..4 {
        helpers::insert_checkpoint_metric(
            &pool,
            sub,
            feed,
            feeder,
            "@acme",
            &format!("https://x/p/{i}/"),
            "d1",
            "Video",
            if i % 2 == 0 { "🔥" } else { "😴" },
            1000.0,
            1000.0,
            i as i64,
        )
        .await;
    }

    aggregates::rebuild_feed(&pool, feed, 30).await.unwrap();
    let first = fetch_aggregates(&pool, feed).await;
    assert!(!first.is_empty());

    aggregates::rebuild_feed(&pool, feed, 30).await.unwrap();
    let second = fetch_aggregates(&pool, feed).await;
    assert_eq!(first.len(), second.len());
    for (a, b) in first.iter().zip(&second) {
        assert_eq!(a.signal_type, b.signal_type);
        assert_eq!(a.signal_key, b.signal_key);
        assert_eq!(a.sample_size, b.sample_size);
        assert!((a.adoption_rate - b.adoption_rate).abs() < 1e-9);
        // Decay weights move with NOW(); equal inputs still land within a
        // hair of the prior run.
        assert!((a.velocity_delta - b.velocity_delta).abs() < 1e-6);
    }
}

#[sqlx::test]
async fn rebuild_scopes_to_subscriber(pool: PgPool) {
    let sub_a = helpers::insert_subscriber(&pool, "A", "sheet-a").await;
    let feed_a = helpers::insert_feed(&pool, sub_a, "market").await;
    let feeder_a = helpers::insert_feeder(&pool, feed_a, "@a", "standard").await;
    let sub_b = helpers::insert_subscriber(&pool, "B", "sheet-b").await;
    let feed_b = helpers::insert_feed(&pool, sub_b, "market").await;
    let feeder_b = helpers::insert_feeder(&pool, feed_b, "@b", "standard").await;

    for (sub, feed, feeder, handle) in
        [(sub_a, feed_a, feeder_a, "@a"), (sub_b, feed_b, feeder_b, "@b")]
    {
        for i in 0..2 {
            helpers::insert_checkpoint_metric(
                &pool,
                sub,
                feed,
                feeder,
                handle,
                &format!("https://x/p/{handle}{i}/"),
                "d1",
                "Video",
                "✅",
                100.0,
                100.0,
                0,
            )
            .await;
        }
    }

    aggregates::rebuild_for_subscriber(&pool, Some(sub_a), 30)
        .await
        .unwrap();
    assert!(!fetch_aggregates(&pool, feed_a).await.is_empty());
    assert!(fetch_aggregates(&pool, feed_b).await.is_empty());
}
