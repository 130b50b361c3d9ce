#[allow(dead_code)]
mod helpers;

use chrono::{TimeDelta, Utc};
use feedpulse::data::health;
use sqlx::PgPool;

#[sqlx::test]
async fn pause_is_initially_clear(pool: PgPool) {
    assert!(health::get_pause_until(&pool).await.unwrap().is_none());
}

#[sqlx::test]
async fn failures_below_trigger_do_not_pause(pool: PgPool) {
    for expected in 1..=4 {
        let (failures, pause) = health::record_failure(&pool, "boom", 5, 3).await.unwrap();
        assert_eq!(failures, expected);
        assert!(pause.is_none());
    }
    assert!(health::get_pause_until(&pool).await.unwrap().is_none());
}

#[sqlx::test]
async fn trigger_opens_breaker_and_resets_counter(pool: PgPool) {
    for _ in 0..4 {
        health::record_failure(&pool, "boom", 5, 3).await.unwrap();
    }
    let (failures, pause) = health::record_failure(&pool, "boom", 5, 3).await.unwrap();
    assert_eq!(failures, 5);

    let pause = pause.expect("breaker should open on the fifth failure");
    let expected = Utc::now() + TimeDelta::hours(3);
    let skew = (pause - expected).num_seconds().abs();
    assert!(skew < 60, "pause should land ~3h out, skew was {skew}s");

    // Counter resets so the next trigger needs a fresh run of failures.
    let (count,): (i32,) =
        sqlx::query_as("SELECT consecutive_failures FROM apify_health WHERE id = 1")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(count, 0);

    let (_, pause_again) = health::record_failure(&pool, "boom", 5, 3).await.unwrap();
    assert!(pause_again.is_none(), "a single new failure must not re-trigger");
}

#[sqlx::test]
async fn success_closes_breaker(pool: PgPool) {
    for _ in 0..5 {
        health::record_failure(&pool, "boom", 5, 3).await.unwrap();
    }
    assert!(health::get_pause_until(&pool).await.unwrap().is_some());

    health::record_success(&pool).await.unwrap();
    assert!(health::get_pause_until(&pool).await.unwrap().is_none());

    let (count, error): (i32, Option<String>) =
        sqlx::query_as("SELECT consecutive_failures, last_error FROM apify_health WHERE id = 1")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(count, 0);
    assert!(error.is_none());
}

#[sqlx::test]
async fn trigger_floor_is_one(pool: PgPool) {
    // A zero trigger behaves as one: every failure pauses.
    let (_, pause) = health::record_failure(&pool, "boom", 0, 0).await.unwrap();
    let pause = pause.expect("trigger of 0 should pause immediately");
    let expected = Utc::now() + TimeDelta::hours(1);
    assert!((pause - expected).num_seconds().abs() < 60);
}
