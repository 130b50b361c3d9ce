//! Scheduling entry point: enumerate subscribers, reconcile feeders, and
//! enqueue work for the current cycle.
//!
//! Daily cycles enqueue one handle-scrape job per tracked tab; weekly
//! cycles refresh profile details instead of scraping posts.

use crate::apify::ApifyClient;
use crate::cli::RunType;
use crate::config::Config;
use crate::data::feeds::{ensure_feeders_for_subscriber, list_subscribers};
use crate::data::posts::{HandleProfile, upsert_handle_profile_metric};
use crate::data::queue::enqueue_handle;
use crate::error::Result;
use crate::sheets::SheetsApi;
use crate::sheets::projection::upsert_profile_snapshot;
use chrono_tz::Tz;
use serde_json::Value;
use sqlx::PgPool;
use tracing::{info, warn};

/// Tabs that never hold handle data regardless of configuration.
const RESERVED_SHEETS: [&str; 2] = ["Feeder", "Billing/Usage"];

pub async fn schedule(
    pool: &PgPool,
    apify: &ApifyClient,
    sheets: &dyn SheetsApi,
    config: &Config,
    run_type: RunType,
) -> Result<()> {
    let ignore = config.ignore_sheets();
    for sub in list_subscribers(pool).await? {
        let titles = match sheets.list_sheet_titles(&sub.spreadsheet_id).await {
            Ok(titles) => titles,
            Err(e) => {
                warn!(subscriber_id = sub.id, error = ?e, "failed to list sheet tabs");
                continue;
            }
        };
        let handle_sheets: Vec<String> = titles
            .into_iter()
            .filter(|t| !ignore.contains(t) && !RESERVED_SHEETS.contains(&t.as_str()))
            .collect();

        ensure_feeders_for_subscriber(pool, sub.id, &handle_sheets).await?;

        match run_type {
            RunType::Weekly => {
                refresh_profiles(pool, apify, sheets, config, sub.id, &sub.spreadsheet_id, &handle_sheets)
                    .await?;
            }
            RunType::Daily => {
                for sheet in &handle_sheets {
                    enqueue_handle(pool, sub.id, &sub.spreadsheet_id, sheet, run_type.as_str())
                        .await?;
                }
                info!(
                    subscriber_id = sub.id,
                    handles = handle_sheets.len(),
                    "handle jobs enqueued"
                );
            }
        }
    }
    Ok(())
}

/// Weekly profile refresh: one details-shape scrape per handle, persisted
/// to `handle_profile_metrics` and projected as the tab's profile banner.
async fn refresh_profiles(
    pool: &PgPool,
    apify: &ApifyClient,
    sheets: &dyn SheetsApi,
    config: &Config,
    subscriber_id: i64,
    spreadsheet_id: &str,
    handles: &[String],
) -> Result<()> {
    let zone: Tz = config.tz.parse().unwrap_or(chrono_tz::UTC);
    let sampled_label = chrono::Utc::now()
        .with_timezone(&zone)
        .format("%d-%m-%y %I:%M %p")
        .to_string();
    let (header, _) = config.sheet_schema();

    for handle in handles {
        let clean = handle.trim_start_matches('@');
        let details = match apify.run_details(clean).await {
            Ok(details) => details,
            Err(e) => {
                warn!(handle = %handle, error = %e, "profile details scrape failed");
                continue;
            }
        };
        if details.is_null() {
            continue;
        }

        let profile = profile_from_details(&details, clean);
        let at_handle = format!("@{clean}");
        upsert_handle_profile_metric(pool, subscriber_id, &at_handle, &profile).await?;
        if let Err(e) = upsert_profile_snapshot(
            sheets,
            spreadsheet_id,
            handle,
            header.len(),
            &at_handle,
            &profile,
            &sampled_label,
        )
        .await
        {
            warn!(handle = %handle, error = ?e, "profile snapshot projection failed");
        }
    }
    Ok(())
}

fn profile_from_details(details: &Value, clean_handle: &str) -> HandleProfile {
    let followers = pick_i64(
        details,
        &["followersCount", "ownerFollowersCount"],
        &["/owner/followersCount", "/owner/edge_followed_by/count"],
    );
    let follows = pick_i64(
        details,
        &["followsCount", "followingsCount", "followingCount"],
        &["/owner/edge_follow/count"],
    );
    let posts = pick_i64(details, &["postsCount", "posts_count"], &[]);

    HandleProfile {
        profile_url: Some(
            details
                .get("url")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("https://www.instagram.com/{clean_handle}/")),
        ),
        full_name: pick_string(details, &["fullName", "full_name"]),
        business_category: pick_string(details, &["businessCategoryName"]),
        biography: pick_string(details, &["biography"]),
        followers_count: followers,
        follows_count: follows,
        posts_count: posts,
        verified: Some(
            details
                .get("verified")
                .or_else(|| details.get("isVerified"))
                .and_then(Value::as_bool)
                .unwrap_or(false),
        ),
        profile_pic_url: pick_string(details, &["profilePicUrlHD", "profilePicUrl"]),
    }
}

fn pick_string(details: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| details.get(k))
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

fn pick_i64(details: &Value, keys: &[&str], pointers: &[&str]) -> Option<i64> {
    let direct = keys
        .iter()
        .filter_map(|k| details.get(k))
        .find_map(value_as_i64);
    direct.or_else(|| {
        pointers
            .iter()
            .filter_map(|p| details.pointer(p))
            .find_map(value_as_i64)
    })
}

fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn profile_collapses_field_variants() {
        let details = json!({
            "fullName": "Acme Co",
            "followersCount": "1200",
            "owner": {"edge_follow": {"count": 310}},
            "isVerified": true,
        });
        let profile = profile_from_details(&details, "acme");
        assert_eq!(profile.full_name.as_deref(), Some("Acme Co"));
        assert_eq!(profile.followers_count, Some(1200));
        assert_eq!(profile.follows_count, Some(310));
        assert_eq!(profile.verified, Some(true));
        assert_eq!(
            profile.profile_url.as_deref(),
            Some("https://www.instagram.com/acme/")
        );
    }
}
