//! One-shot repair pass: normalize historical stage labels, recompute
//! tags from stored percentiles, and push the repaired signal columns
//! back to each handle sheet.
//!
//! Early deployments shipped other stage vocabularies (WATCH, C1/C3/C7,
//! 👀) and tags that drifted from their percentile bands; this pass makes
//! the database canonical and then reprojects only the cells that differ.

use crate::config::Config;
use crate::data::feeds::list_subscribers;
use crate::data::posts::get_post_signal_map;
use crate::error::Result;
use crate::sheets::{RangeUpdate, SheetsApi};
use crate::sheets::projection::col_letter;
use crate::util::shortcode_from_url;
use crate::velocity::INSUFFICIENT_DATA;
use sqlx::PgPool;
use tracing::{debug, info};

pub async fn repair_velocity(
    pool: &PgPool,
    sheets: &dyn SheetsApi,
    config: &Config,
    subscriber_id: Option<i64>,
) -> Result<()> {
    let ignore = config.ignore_sheets();
    for sub in list_subscribers(pool)
        .await?
        .into_iter()
        .filter(|s| subscriber_id.is_none_or(|id| s.id == id))
    {
        normalize_signal_rows(pool, sub.id).await?;

        let titles = sheets.list_sheet_titles(&sub.spreadsheet_id).await?;
        let handles: Vec<String> = titles
            .into_iter()
            .filter(|t| !ignore.contains(t) && t != "Feeder" && t != "Billing/Usage")
            .collect();

        for handle in &handles {
            reproject_handle(pool, sheets, config, sub.id, &sub.spreadsheet_id, handle).await?;
        }
        info!(subscriber_id = sub.id, handles = handles.len(), "velocity repair complete");
    }
    Ok(())
}

/// Canonicalize stage labels and re-derive tags from stored percentiles.
async fn normalize_signal_rows(pool: &PgPool, subscriber_id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE post_signals
         SET velocity_stage = CASE
                WHEN UPPER(COALESCE(velocity_stage, '')) IN ('D3', 'C3') THEN 'D3'
                WHEN UPPER(COALESCE(velocity_stage, '')) IN ('D7', 'C7') THEN 'D7'
                WHEN UPPER(COALESCE(velocity_stage, '')) IN ('D21', 'C21') THEN 'D21'
                WHEN posted_at >= NOW() - INTERVAL '24 hours' THEN 'D1'
                WHEN posted_at >= NOW() - INTERVAL '72 hours' THEN 'D2'
                ELSE 'D2'
             END,
             velocity_tag = CASE
                WHEN COALESCE(velocity_percentile, '') ~ '^[0-9]+%$' THEN
                    CASE
                        WHEN replace(velocity_percentile, '%', '')::INT <= 5 THEN '🚀'
                        WHEN replace(velocity_percentile, '%', '')::INT <= 15 THEN '🔥'
                        WHEN replace(velocity_percentile, '%', '')::INT <= 35 THEN '✅'
                        ELSE '😴'
                    END
                ELSE ''
             END,
             updated_at = NOW()
         WHERE subscriber_id = $1",
    )
    .bind(subscriber_id)
    .execute(pool)
    .await?;

    // D1/D2 are age-determined even for rows already labeled.
    sqlx::query(
        "UPDATE post_signals
         SET velocity_stage = CASE
                WHEN posted_at >= NOW() - INTERVAL '24 hours' THEN 'D1'
                WHEN posted_at >= NOW() - INTERVAL '72 hours' THEN 'D2'
                ELSE velocity_stage
             END,
             updated_at = NOW()
         WHERE subscriber_id = $1",
    )
    .bind(subscriber_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Push repaired tag/percentile/stage cells to one handle tab, writing
/// only rows that differ.
async fn reproject_handle(
    pool: &PgPool,
    sheets: &dyn SheetsApi,
    config: &Config,
    subscriber_id: i64,
    spreadsheet_id: &str,
    handle: &str,
) -> Result<()> {
    let signal_map = get_post_signal_map(pool, subscriber_id, handle).await?;
    if signal_map.is_empty() {
        return Ok(());
    }

    let (header, _) = config.sheet_schema();
    let (Some(tag_idx), Some(pct_idx), Some(stage_idx)) = (
        header.iter().position(|c| c == "velocity"),
        header.iter().position(|c| c == "velocity_percentile"),
        header.iter().position(|c| c == "velocity_stage"),
    ) else {
        return Ok(());
    };

    let end_col = col_letter(header.len());
    let rows = sheets
        .get_values(spreadsheet_id, &format!("{handle}!A3:{end_col}10000"))
        .await?;

    let cell = |row: &Vec<String>, idx: usize| -> String {
        row.get(idx).map(|s| s.trim().to_string()).unwrap_or_default()
    };

    let mut updates: Vec<RangeUpdate> = Vec::new();
    for (i, row) in rows.iter().enumerate() {
        let row_num = 3 + i;
        let post_url = cell(row, 0);
        if post_url.is_empty() {
            continue;
        }
        let Some(sig) = signal_map.get(&shortcode_from_url(&post_url)) else {
            continue;
        };

        let raw_tag = sig.velocity_tag.clone().unwrap_or_default();
        let (tag, percentile) = if raw_tag.trim().eq_ignore_ascii_case(INSUFFICIENT_DATA) {
            (String::new(), String::new())
        } else {
            (raw_tag, sig.velocity_percentile.clone().unwrap_or_default())
        };
        let stage = canonical_stage(sig.velocity_stage.as_deref().unwrap_or(""), &tag);

        let existing = (cell(row, tag_idx), cell(row, pct_idx), cell(row, stage_idx));
        if existing == (tag.clone(), percentile.clone(), stage.clone()) {
            continue;
        }

        if pct_idx == tag_idx + 1 && stage_idx == pct_idx + 1 {
            updates.push(RangeUpdate {
                range: format!(
                    "{handle}!{}{row_num}:{}{row_num}",
                    col_letter(tag_idx + 1),
                    col_letter(stage_idx + 1)
                ),
                values: vec![vec![tag, percentile, stage]],
            });
        } else {
            for (idx, value) in [(tag_idx, tag), (pct_idx, percentile), (stage_idx, stage)] {
                let col = col_letter(idx + 1);
                updates.push(RangeUpdate {
                    range: format!("{handle}!{col}{row_num}:{col}{row_num}"),
                    values: vec![vec![value]],
                });
            }
        }
    }

    if !updates.is_empty() {
        debug!(handle, cells = updates.len(), "reprojecting repaired signals");
        sheets.batch_update(spreadsheet_id, updates).await?;
    }
    Ok(())
}

/// Collapse legacy stage vocabularies onto the canonical D-labels.
pub fn canonical_stage(stage: &str, tag: &str) -> String {
    let st = stage.trim().to_uppercase();
    if tag.contains("👀") {
        return "D2".to_string();
    }
    match st.as_str() {
        "WATCH" | "C1" | "C1R" | "D2" => "D2".to_string(),
        "D1" => "D1".to_string(),
        "D3" | "C3" => "D3".to_string(),
        "D7" | "C7" => "D7".to_string(),
        "D21" | "C21" => "D21".to_string(),
        other => other.to_string(),
    }
}
