#[allow(dead_code)]
mod helpers;

use feedpulse::alerts::generate_alert_candidates;
use feedpulse::data::embeddings::{
    embedding_exists, list_recent_embeddings, upsert_post_embedding,
};
use serde_json::json;
use sqlx::PgPool;

#[sqlx::test]
async fn embedding_upsert_is_keyed_by_model_and_signal_type(pool: PgPool) {
    let sub = helpers::insert_subscriber(&pool, "Acme", "sheet-1").await;

    assert!(
        !embedding_exists(&pool, sub, "@acme", "https://x/p/a/", "model-s", "caption_semantic")
            .await
            .unwrap()
    );

    upsert_post_embedding(
        &pool,
        sub,
        "@acme",
        "https://x/p/a/",
        "model-s",
        "caption_semantic",
        "v1",
        json!({"velocity_tag": "🔥"}),
        "text a",
        &[0.1, 0.2, 0.3],
    )
    .await
    .unwrap();

    assert!(
        embedding_exists(&pool, sub, "@acme", "https://x/p/a/", "model-s", "caption_semantic")
            .await
            .unwrap()
    );
    // A different signal type for the same post is a separate row.
    assert!(
        !embedding_exists(&pool, sub, "@acme", "https://x/p/a/", "model-s", "performance_semantic")
            .await
            .unwrap()
    );

    // Rewriting the same key replaces the vector in place.
    upsert_post_embedding(
        &pool,
        sub,
        "@acme",
        "https://x/p/a/",
        "model-s",
        "caption_semantic",
        "v1",
        json!({}),
        "text a2",
        &[0.9, 0.8],
    )
    .await
    .unwrap();
    let (count, dim): (i64, i32) =
        sqlx::query_as("SELECT COUNT(*), MIN(embedding_dim) FROM post_embeddings")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(count, 1);
    assert_eq!(dim, 2);
}

#[sqlx::test]
async fn recent_embeddings_carry_posted_at(pool: PgPool) {
    let sub = helpers::insert_subscriber(&pool, "Acme", "sheet-1").await;

    sqlx::query(
        "INSERT INTO posts_core (subscriber_id, handle, post_url, posted_at)
         VALUES ($1, '@acme', 'https://x/p/a/', NOW() - INTERVAL '2 days')",
    )
    .bind(sub)
    .execute(&pool)
    .await
    .unwrap();

    upsert_post_embedding(
        &pool,
        sub,
        "@acme",
        "https://x/p/a/",
        "model-s",
        "performance_semantic",
        "v1",
        json!({}),
        "text",
        &[1.0, 0.0],
    )
    .await
    .unwrap();

    let (feed_id,): (i64,) = sqlx::query_as("SELECT id FROM feeds WHERE subscriber_id = $1")
        .bind(sub)
        .fetch_one(&pool)
        .await
        .unwrap();

    let rows = list_recent_embeddings(&pool, feed_id, "performance_semantic", 7, 60)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].posted_at.is_some());

    // Other signal types stay out of the mimicry scan.
    let rows = list_recent_embeddings(&pool, feed_id, "caption_semantic", 7, 60)
        .await
        .unwrap();
    assert!(rows.is_empty());
}

#[sqlx::test]
async fn mimicry_flags_the_later_posted_feeder(pool: PgPool) {
    let sub = helpers::insert_subscriber(&pool, "Acme", "sheet-1").await;

    for (handle, url, days_ago) in [
        ("@original", "https://x/p/orig/", 5),
        ("@copycat", "https://x/p/copy/", 1),
    ] {
        sqlx::query(
            "INSERT INTO posts_core (subscriber_id, handle, post_url, posted_at)
             VALUES ($1, $2, $3, NOW() - make_interval(days => $4))",
        )
        .bind(sub)
        .bind(handle)
        .bind(url)
        .bind(days_ago)
        .execute(&pool)
        .await
        .unwrap();

        // Near-identical performance vectors on different feeders.
        upsert_post_embedding(
            &pool,
            sub,
            handle,
            url,
            "model-s",
            "performance_semantic",
            "v1",
            json!({}),
            "text",
            &[0.6, 0.8, 0.0],
        )
        .await
        .unwrap();
    }

    generate_alert_candidates(&pool, None, 3).await.unwrap();

    let (title, payload): (String, serde_json::Value) = sqlx::query_as(
        "SELECT title, payload FROM alert_candidates WHERE alert_type = 'visual_mimicry'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(title, "Possible mimicry: @copycat");
    assert_eq!(payload["source_handle"], "@original");
    assert_eq!(payload["mimic_handle"], "@copycat");
    assert!(payload["similarity"].as_f64().unwrap() >= 0.93);
}
