//! Sync orchestration: scrape results in, classified state out.
//!
//! `sync_handle` ingests a handle's recent posts; `sync_post_checkpoint_batch`
//! refreshes a batch of posts at one scheduled checkpoint. Both paths
//! normalize provider items, merge snapshots, run the velocity
//! classifier, persist signals and checkpoint metrics, and project the
//! resulting rows to the handle's sheet tab.

use crate::apify::normalize::NormalizedPost;
use crate::apify::{ApifyClient, QueryShape};
use crate::config::Config;
use crate::data::models::{Checkpoint, PostSnapshot};
use crate::data::posts::{
    self, CheckpointMetric, get_snapshots, latest_followers, upsert_post_core, upsert_post_signal,
    upsert_snapshot, velocity_pool,
};
use crate::data::queue::ensure_post_checkpoint_jobs;
use crate::error::Result;
use crate::lifecycle::{age_hours, checkpoint_from_age, stage_label};
use crate::sheets::SheetsApi;
use crate::sheets::projection::{
    existing_row_index, plan_row_writes, sheet_datetime, sort_by_posted_at,
};
use crate::util::shortcode_from_url;
use crate::velocity::{Classification, classify, metric_value};
use chrono::Utc;
use sqlx::PgPool;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// Shared handles for one sync pass.
pub struct SyncContext<'a> {
    pub pool: &'a PgPool,
    pub apify: &'a ApifyClient,
    pub sheets: &'a dyn SheetsApi,
    pub config: &'a Config,
}

/// Outcome of a handle sync, reported to the run log.
#[derive(Debug, Default)]
pub struct HandleSyncOutcome {
    pub latest_post_url: Option<String>,
    pub items_returned: usize,
    pub inserted: usize,
    pub updated: usize,
}

fn scrape_handle(handle: &str) -> &str {
    handle.trim().trim_start_matches('@')
}

/// Scrape a handle and ingest every returned post at its age-derived d1
/// stage, scheduling the future checkpoints.
pub async fn sync_handle(
    ctx: &SyncContext<'_>,
    subscriber_id: i64,
    spreadsheet_id: &str,
    handle: &str,
    sheet_name: &str,
    run_type: &str,
) -> Result<HandleSyncOutcome> {
    let shape = if run_type == "weekly" {
        QueryShape::Weekly
    } else {
        QueryShape::Daily
    };
    let items = ctx.apify.run(scrape_handle(handle), shape).await?;

    let (header, descriptions) = ctx.config.sheet_schema();
    crate::sheets::projection::ensure_header(
        ctx.sheets,
        spreadsheet_id,
        sheet_name,
        &header,
        &descriptions,
    )
    .await?;
    let values = ctx
        .sheets
        .get_values(spreadsheet_id, &format!("{sheet_name}!A3:AZ10000"))
        .await?;
    let existing = existing_row_index(&header, &values);

    let follower_baseline = match latest_followers(ctx.pool, subscriber_id, handle).await? {
        Some(v) => Some(v),
        None => {
            let at_handle = format!("@{}", handle.trim_start_matches('@'));
            latest_followers(ctx.pool, subscriber_id, &at_handle).await?
        }
    };

    let mut outcome = HandleSyncOutcome {
        items_returned: items.len(),
        ..Default::default()
    };
    let mut records: Vec<HashMap<String, String>> = Vec::new();

    for item in &items {
        let mut norm = NormalizedPost::from_item(item);
        if norm.post_url.is_empty() {
            continue;
        }
        // The provider occasionally omits the owner; fall back to the
        // handle we were asked to sync.
        if norm.handle.is_empty() {
            norm.handle = handle.trim_start_matches('@').to_string();
        }

        upsert_post_core(ctx.pool, subscriber_id, handle, &norm).await?;

        let mut record = base_record(&norm, ctx.config);
        record.insert(
            "perf_score".to_string(),
            perf_score(&norm, follower_baseline),
        );
        apply_velocity(
            ctx.pool,
            subscriber_id,
            handle,
            &norm,
            Some(Checkpoint::D1),
            &mut record,
        )
        .await?;

        if let Some(posted_at) = norm.posted_at {
            ensure_post_checkpoint_jobs(
                ctx.pool,
                subscriber_id,
                spreadsheet_id,
                handle,
                &norm.post_url,
                posted_at,
            )
            .await?;
        }

        if outcome.latest_post_url.is_none() {
            outcome.latest_post_url = Some(norm.post_url.clone());
        }
        records.push(record);
    }

    let (updates, appends) = plan_row_writes(sheet_name, &header, &existing, &records);
    outcome.updated = updates.len();
    outcome.inserted = appends.len();
    ctx.sheets.batch_update(spreadsheet_id, updates).await?;
    ctx.sheets
        .append_values(spreadsheet_id, &format!("{sheet_name}!A3"), appends)
        .await?;
    sort_by_posted_at(ctx.sheets, spreadsheet_id, sheet_name, &header).await?;

    info!(
        handle,
        items = outcome.items_returned,
        inserted = outcome.inserted,
        updated = outcome.updated,
        "handle sync complete"
    );
    Ok(outcome)
}

/// Refresh a batch of posts of one `(subscriber, handle, checkpoint)` with
/// a single provider call.
///
/// Returns the set of requested URLs the provider actually covered; the
/// worker retries jobs whose URL is missing from the response.
pub async fn sync_post_checkpoint_batch(
    ctx: &SyncContext<'_>,
    subscriber_id: i64,
    spreadsheet_id: &str,
    handle: &str,
    sheet_name: &str,
    checkpoint: Checkpoint,
    post_urls: &[String],
) -> Result<HashSet<String>> {
    let items = ctx
        .apify
        .run_post_urls(scrape_handle(handle), post_urls)
        .await?;

    let (header, descriptions) = ctx.config.sheet_schema();
    crate::sheets::projection::ensure_header(
        ctx.sheets,
        spreadsheet_id,
        sheet_name,
        &header,
        &descriptions,
    )
    .await?;
    let values = ctx
        .sheets
        .get_values(spreadsheet_id, &format!("{sheet_name}!A3:AZ10000"))
        .await?;
    let existing = existing_row_index(&header, &values);

    // Requested URLs keyed by shortcode so trailing-slash and query-string
    // variants still resolve.
    let requested: HashMap<String, &String> = post_urls
        .iter()
        .map(|u| (shortcode_from_url(u), u))
        .filter(|(code, _)| !code.is_empty())
        .collect();

    let follower_baseline = latest_followers(ctx.pool, subscriber_id, handle).await?;

    let mut covered: HashSet<String> = HashSet::new();
    let mut records: Vec<HashMap<String, String>> = Vec::new();

    for item in &items {
        let mut norm = NormalizedPost::from_item(item);
        if norm.handle.is_empty() {
            norm.handle = handle.trim_start_matches('@').to_string();
        }
        // Resolve back to the queue's own URL key.
        let code = shortcode_from_url(&norm.post_url);
        let queue_url = requested
            .get(&code)
            .copied()
            .or_else(|| post_urls.iter().find(|u| **u == norm.post_url));
        let Some(queue_url) = queue_url else {
            debug!(post_url = %norm.post_url, "batch item not in requested set");
            continue;
        };
        norm.post_url = queue_url.clone();
        covered.insert(queue_url.clone());

        upsert_post_core(ctx.pool, subscriber_id, handle, &norm).await?;

        let mut record = base_record(&norm, ctx.config);
        record.insert(
            "perf_score".to_string(),
            perf_score(&norm, follower_baseline),
        );
        apply_velocity(
            ctx.pool,
            subscriber_id,
            handle,
            &norm,
            Some(checkpoint),
            &mut record,
        )
        .await?;
        records.push(record);
    }

    let (updates, appends) = plan_row_writes(sheet_name, &header, &existing, &records);
    ctx.sheets.batch_update(spreadsheet_id, updates).await?;
    ctx.sheets
        .append_values(spreadsheet_id, &format!("{sheet_name}!A3"), appends)
        .await?;
    sort_by_posted_at(ctx.sheets, spreadsheet_id, sheet_name, &header).await?;

    if covered.len() < post_urls.len() {
        warn!(
            requested = post_urls.len(),
            covered = covered.len(),
            checkpoint = checkpoint.as_str(),
            "provider response missing batch posts"
        );
    }
    Ok(covered)
}

/// Classify a post at `checkpoint` from its stored snapshot data.
///
/// The late-bloomer prefix applies at d7 when a ranked, non-hot d1
/// baseline exists; a post never observed at d1 has no baseline and gets
/// no prefix.
pub async fn classify_checkpoint(
    pool: &PgPool,
    subscriber_id: i64,
    handle: &str,
    snap: &PostSnapshot,
    media_type: &str,
    checkpoint: Checkpoint,
) -> Result<Classification> {
    let Some(current_metric) = metric_for_checkpoint(snap, media_type, checkpoint) else {
        return Ok(Classification::Unranked);
    };
    let metric_per_day = current_metric / checkpoint.days();

    let pool_values = velocity_pool(pool, subscriber_id, handle, media_type, checkpoint).await?;
    let mut classification = classify(
        &pool_values,
        metric_per_day,
        checkpoint.min_cohort_size(),
    );

    if checkpoint == Checkpoint::D7
        && let Classification::Ranked { label, .. } = &mut classification
        && label.tag.is_hot()
    {
        let baseline = baseline_d1(pool, subscriber_id, handle, snap, media_type).await?;
        if let Some(hot) = baseline
            && !hot
        {
            label.late_bloomer = true;
        }
    }
    Ok(classification)
}

/// Whether the post's d1 baseline was hot; `None` when the post was never
/// ranked at d1.
async fn baseline_d1(
    pool: &PgPool,
    subscriber_id: i64,
    handle: &str,
    snap: &PostSnapshot,
    media_type: &str,
) -> Result<Option<bool>> {
    let Some(metric) = metric_for_checkpoint(snap, media_type, Checkpoint::D1) else {
        return Ok(None);
    };
    let pool_values =
        velocity_pool(pool, subscriber_id, handle, media_type, Checkpoint::D1).await?;
    let classification = classify(
        &pool_values,
        metric / Checkpoint::D1.days(),
        Checkpoint::D1.min_cohort_size(),
    );
    match classification {
        Classification::Ranked { .. } => Ok(Some(classification.is_hot())),
        _ => Ok(None),
    }
}

/// Metric value from a snapshot's checkpoint triple, `None` when nothing
/// was observed there.
pub fn metric_for_checkpoint(
    snap: &PostSnapshot,
    media_type: &str,
    checkpoint: Checkpoint,
) -> Option<f64> {
    let (v, l, c) = snap.triple(checkpoint);
    if v.is_none() && l.is_none() && c.is_none() {
        return None;
    }
    Some(metric_value(media_type, v, l, c))
}

/// Merge the scrape into the snapshot, classify, persist signal and
/// checkpoint metric, and fill the projected row's velocity columns.
///
/// The D21 gate lives here: a d21 refresh for a post whose D7 stage was
/// not hot rewrites the signal from the D7 classification and records no
/// d21 snapshot.
pub async fn apply_velocity(
    pool: &PgPool,
    subscriber_id: i64,
    handle: &str,
    norm: &NormalizedPost,
    forced_checkpoint: Option<Checkpoint>,
    record: &mut HashMap<String, String>,
) -> Result<()> {
    let Some(posted_at) = norm.posted_at else {
        return Ok(());
    };
    let now = Utc::now();
    let age = age_hours(now, posted_at);
    let checkpoint = forced_checkpoint.unwrap_or_else(|| checkpoint_from_age(age));
    let stage = stage_label(checkpoint, age);
    record.insert("velocity_stage".to_string(), stage.to_string());

    if checkpoint == Checkpoint::D21
        && let Some(snap) = get_snapshots(pool, subscriber_id, handle, &norm.post_url).await?
    {
        let media_type = snap
            .media_type
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| norm.media_type.clone());
        let d7 = classify_checkpoint(
            pool,
            subscriber_id,
            handle,
            &snap,
            &media_type,
            Checkpoint::D7,
        )
        .await?;
        if !d7.is_hot() {
            // D21 withheld by the gate: the visible signal stays at its D7
            // classification and no d21 snapshot is recorded.
            record.insert("velocity".to_string(), d7.sheet_tag());
            record.insert("velocity_percentile".to_string(), d7.sheet_percentile());
            record.insert("velocity_stage".to_string(), "D7".to_string());

            let tag = d7.signal_tag();
            let percentile = d7.percentile_string();
            upsert_post_signal(
                pool,
                subscriber_id,
                handle,
                &norm.post_url,
                Some(&norm.media_type),
                Some(posted_at),
                Some(&norm.caption),
                &tag,
                "D7",
                &percentile,
            )
            .await?;

            let (v, l, c) = snap.triple(Checkpoint::D7);
            let d7_metric = metric_for_checkpoint(&snap, &media_type, Checkpoint::D7);
            posts::upsert_checkpoint_metric(
                pool,
                subscriber_id,
                handle,
                &norm.post_url,
                CheckpointMetric {
                    checkpoint: Checkpoint::D7,
                    stage_label: "D7",
                    media_type: Some(&media_type),
                    views: v,
                    likes: l,
                    comments: c,
                    metric_value: d7_metric,
                    velocity_value: d7_metric.map(|m| m / Checkpoint::D7.days()),
                    velocity_tag: &tag,
                    velocity_percentile: &percentile,
                    perf_score: None,
                },
            )
            .await?;
            return Ok(());
        }
    }

    // Latest scrape wins on the checkpoint triple.
    upsert_snapshot(
        pool,
        subscriber_id,
        handle,
        &norm.post_url,
        Some(norm.media_type.as_str()).filter(|m| !m.is_empty()),
        Some(posted_at),
        checkpoint,
        norm.views,
        norm.likes,
        norm.comments,
    )
    .await?;

    let Some(snap) = get_snapshots(pool, subscriber_id, handle, &norm.post_url).await? else {
        return Ok(());
    };
    let media_type = snap
        .media_type
        .clone()
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| norm.media_type.clone());

    let classification =
        classify_checkpoint(pool, subscriber_id, handle, &snap, &media_type, checkpoint).await?;

    record.insert("velocity".to_string(), classification.sheet_tag());
    record.insert(
        "velocity_percentile".to_string(),
        classification.sheet_percentile(),
    );

    let tag = classification.signal_tag();
    let percentile = classification.percentile_string();
    upsert_post_signal(
        pool,
        subscriber_id,
        handle,
        &norm.post_url,
        Some(&norm.media_type),
        Some(posted_at),
        Some(&norm.caption),
        &tag,
        stage,
        &percentile,
    )
    .await?;

    let metric_now = metric_value(&norm.media_type, norm.views, norm.likes, norm.comments);
    posts::upsert_checkpoint_metric(
        pool,
        subscriber_id,
        handle,
        &norm.post_url,
        CheckpointMetric {
            checkpoint,
            stage_label: stage,
            media_type: Some(&media_type),
            views: norm.views,
            likes: norm.likes,
            comments: norm.comments,
            metric_value: Some(metric_now),
            velocity_value: Some(metric_now / checkpoint.days()),
            velocity_tag: &tag,
            velocity_percentile: &percentile,
            perf_score: record.get("perf_score").map(String::as_str).filter(|s| !s.is_empty()),
        },
    )
    .await?;
    Ok(())
}

/// Engagement-rate score rendered as "N.NN%".
///
/// Video posts rate engagement against views; image and carousel posts
/// rate against the weekly followers baseline when one exists.
pub fn perf_score(norm: &NormalizedPost, followers_baseline: Option<i64>) -> String {
    let media = norm.media_type.to_lowercase();
    let views = norm.views.unwrap_or(0);
    let likes = norm.likes.unwrap_or(0);
    let comments = norm.comments.unwrap_or(0);

    if media.contains("video") || media.contains("reel") {
        if views <= 0 {
            return String::new();
        }
        let score = f64::from(likes + comments) / f64::from(views) * 100.0;
        return format!("{score:.2}%");
    }

    match followers_baseline {
        Some(followers) if followers > 0 => {
            let score = f64::from(likes + comments) / followers as f64 * 100.0;
            format!("{score:.2}%")
        }
        _ => String::new(),
    }
}

/// Projected row fields shared by every sync path, keyed by sheet column
/// name.
fn base_record(norm: &NormalizedPost, config: &Config) -> HashMap<String, String> {
    let scanned = sheet_datetime(Utc::now(), &config.tz);
    let mut record = HashMap::new();
    record.insert("post_url".to_string(), norm.post_url.clone());
    record.insert(
        "posted_at".to_string(),
        norm.posted_at
            .map(|dt| sheet_datetime(dt, &config.tz))
            .unwrap_or_default(),
    );
    record.insert("handle".to_string(), norm.handle.clone());
    record.insert("display_name".to_string(), norm.display_name.clone());
    record.insert(
        "followers_at_scan".to_string(),
        norm.followers_at_scan
            .map(|v| v.to_string())
            .unwrap_or_default(),
    );
    record.insert("media_type".to_string(), norm.media_type.clone());
    record.insert(
        "is_pinned".to_string(),
        if norm.is_pinned { "TRUE" } else { "FALSE" }.to_string(),
    );
    record.insert(
        "views".to_string(),
        norm.views.map(|v| v.to_string()).unwrap_or_default(),
    );
    record.insert(
        "likes".to_string(),
        norm.likes.map(|v| v.to_string()).unwrap_or_default(),
    );
    record.insert(
        "comments".to_string(),
        norm.comments.map(|v| v.to_string()).unwrap_or_default(),
    );
    record.insert("perf_score".to_string(), String::new());
    record.insert("velocity".to_string(), String::new());
    record.insert("velocity_percentile".to_string(), String::new());
    record.insert("velocity_stage".to_string(), String::new());
    record.insert("caption".to_string(), norm.caption.clone());
    record.insert("hashtags".to_string(), norm.hashtags.clone());
    record.insert("caption_mentions".to_string(), norm.caption_mentions.clone());
    record.insert("tagged_users".to_string(), norm.tagged_users.clone());
    record.insert("music_info".to_string(), norm.music_info.clone());
    record.insert(
        "duration_seconds".to_string(),
        norm.duration_seconds
            .map(|v| v.to_string())
            .unwrap_or_default(),
    );
    record.insert(
        "paid_partnership".to_string(),
        if norm.paid_partnership { "TRUE" } else { "FALSE" }.to_string(),
    );
    record.insert("sponsors".to_string(), norm.sponsors.clone());
    record.insert("display_url".to_string(), norm.display_url.clone());
    record.insert("video_url".to_string(), norm.video_url.clone());
    record.insert("scanned_at".to_string(), scanned.clone());
    record.insert("last_updated_at".to_string(), scanned);
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video_post(views: i32, likes: i32, comments: i32) -> NormalizedPost {
        NormalizedPost {
            media_type: "Video".to_string(),
            views: Some(views),
            likes: Some(likes),
            comments: Some(comments),
            ..Default::default()
        }
    }

    #[test]
    fn perf_score_video_uses_views() {
        let norm = video_post(1000, 80, 20);
        assert_eq!(perf_score(&norm, None), "10.00%");
    }

    #[test]
    fn perf_score_video_without_views_is_empty() {
        let norm = video_post(0, 80, 20);
        assert_eq!(perf_score(&norm, Some(1000)), "");
    }

    #[test]
    fn perf_score_image_uses_followers_baseline() {
        let norm = NormalizedPost {
            media_type: "Image".to_string(),
            likes: Some(30),
            comments: Some(20),
            ..Default::default()
        };
        assert_eq!(perf_score(&norm, Some(2000)), "2.50%");
        assert_eq!(perf_score(&norm, None), "");
    }

    #[test]
    fn metric_for_checkpoint_requires_an_observation() {
        let snap = PostSnapshot {
            d7_views: Some(700),
            ..Default::default()
        };
        assert_eq!(metric_for_checkpoint(&snap, "video", Checkpoint::D7), Some(700.0));
        assert_eq!(metric_for_checkpoint(&snap, "video", Checkpoint::D3), None);
    }
}
