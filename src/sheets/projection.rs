//! Row projection onto per-handle sheets.
//!
//! Each handle has one tab: header on row 1, column descriptions on row
//! 2, data from row 3 down. Rows are keyed by `post_url`. Header
//! mismatches are repaired by column-name rematch so data never sits
//! under the wrong header. All writes are idempotent; the relational
//! store stays authoritative.

use crate::sheets::{RangeUpdate, SheetsApi};
use crate::error::Result;
use chrono::{DateTime, Datelike, Timelike, Utc};
use chrono_tz::Tz;
use std::collections::HashMap;

/// First data row (1-based) on every handle tab.
pub const DATA_START_ROW: usize = 3;

/// A1 column letter for a 1-based column number.
pub fn col_letter(mut n: usize) -> String {
    let mut out = String::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        out.insert(0, (b'A' + rem as u8) as char);
        n = (n - 1) / 26;
    }
    out
}

/// Locale-independent spreadsheet datetime formula in the given timezone.
pub fn sheet_datetime(dt: DateTime<Utc>, tz: &str) -> String {
    let zone: Tz = tz.parse().unwrap_or(chrono_tz::UTC);
    let local = dt.with_timezone(&zone);
    format!(
        "=DATE({},{},{})+TIME({},{},{})",
        local.year(),
        local.month(),
        local.day(),
        local.hour(),
        local.minute(),
        local.second()
    )
}

/// Ensure the configured header is in place, migrating legacy data by
/// column name when the stored header differs.
pub async fn ensure_header(
    api: &dyn SheetsApi,
    spreadsheet_id: &str,
    sheet_name: &str,
    header: &[String],
    descriptions: &[String],
) -> Result<()> {
    let existing = api
        .get_values(spreadsheet_id, &format!("{sheet_name}!1:2"))
        .await?;

    let header_rows = vec![header.to_vec(), descriptions.to_vec()];

    let Some(stored) = existing.first().filter(|row| !row.is_empty()) else {
        api.clear_values(spreadsheet_id, &format!("{sheet_name}!A1:AZ2"))
            .await?;
        api.update_values(spreadsheet_id, &format!("{sheet_name}!1:2"), header_rows)
            .await?;
        return Ok(());
    };

    if stored[..] == header[..] {
        // Re-assert the description row; older tabs may predate it.
        api.update_values(spreadsheet_id, &format!("{sheet_name}!1:2"), header_rows)
            .await?;
        return Ok(());
    }

    // Header changed: move each legacy column's values under the matching
    // new column so data never lands under the wrong header.
    let rows = api
        .get_values(spreadsheet_id, &format!("{sheet_name}!A3:AZ10000"))
        .await?;
    let migrated = migrate_rows(stored, header, &rows);

    api.clear_values(spreadsheet_id, &format!("{sheet_name}!A1:AZ10000"))
        .await?;
    api.update_values(spreadsheet_id, &format!("{sheet_name}!1:2"), header_rows)
        .await?;
    api.append_values(spreadsheet_id, &format!("{sheet_name}!A3"), migrated)
        .await?;
    Ok(())
}

/// Rebuild data rows for a new header by matching legacy column names.
/// Columns absent from the legacy header come back blank.
pub fn migrate_rows(
    legacy_header: &[String],
    new_header: &[String],
    rows: &[Vec<String>],
) -> Vec<Vec<String>> {
    let legacy_idx: HashMap<&str, usize> = legacy_header
        .iter()
        .enumerate()
        .map(|(i, name)| (name.as_str(), i))
        .collect();

    rows.iter()
        .map(|row| {
            new_header
                .iter()
                .map(|col| {
                    legacy_idx
                        .get(col.as_str())
                        .and_then(|&i| row.get(i))
                        .cloned()
                        .unwrap_or_default()
                })
                .collect()
        })
        .collect()
}

/// Map `post_url -> 1-based sheet row` from the current data region.
pub fn existing_row_index(
    header: &[String],
    rows: &[Vec<String>],
) -> HashMap<String, usize> {
    let url_idx = header.iter().position(|c| c == "post_url").unwrap_or(0);
    let mut index = HashMap::new();
    for (i, row) in rows.iter().enumerate() {
        if let Some(url) = row.get(url_idx).filter(|u| !u.is_empty()) {
            index.insert(url.clone(), DATA_START_ROW + i);
        }
    }
    index
}

/// Split projected rows into in-place updates (known post_url) and
/// appends (new post_url), in input order.
pub fn plan_row_writes(
    sheet_name: &str,
    header: &[String],
    existing: &HashMap<String, usize>,
    records: &[HashMap<String, String>],
) -> (Vec<RangeUpdate>, Vec<Vec<String>>) {
    let url_key = "post_url";
    let end_col = col_letter(header.len());
    let mut updates = Vec::new();
    let mut appends = Vec::new();

    for record in records {
        let row: Vec<String> = header
            .iter()
            .map(|col| record.get(col).cloned().unwrap_or_default())
            .collect();
        let url = record.get(url_key).map(String::as_str).unwrap_or("");
        match existing.get(url) {
            Some(&row_num) => updates.push(RangeUpdate {
                range: format!("{sheet_name}!A{row_num}:{end_col}{row_num}"),
                values: vec![row],
            }),
            None => appends.push(row),
        }
    }
    (updates, appends)
}

/// Project the weekly profile banner to the right of the schema columns,
/// so it never collides with data columns.
pub async fn upsert_profile_snapshot(
    api: &dyn SheetsApi,
    spreadsheet_id: &str,
    sheet_name: &str,
    header_len: usize,
    handle: &str,
    profile: &crate::data::posts::HandleProfile,
    sampled_at_label: &str,
) -> Result<()> {
    fn count_or_na(value: Option<i64>) -> String {
        value.map(|v| v.to_string()).unwrap_or_else(|| "n/a".to_string())
    }

    let trust = if profile.verified == Some(true) {
        "Verified"
    } else {
        "Standard"
    };
    let category = profile
        .business_category
        .clone()
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| "n/a".to_string());

    let labels = vec![vec![
        "HANDLE SNAPSHOT".to_string(),
        "Followers".to_string(),
        "Following".to_string(),
        "Posts".to_string(),
        "Trust / Category".to_string(),
    ]];
    let values = vec![vec![
        handle.to_string(),
        format!("{} • Audience", count_or_na(profile.followers_count)),
        format!("{} • Network", count_or_na(profile.follows_count)),
        format!("{} • Lifetime Posts", count_or_na(profile.posts_count)),
        format!("{trust} • {category} • {sampled_at_label}"),
    ]];

    let start_col = col_letter(header_len + 1);
    let end_col = col_letter(header_len + 5);
    api.clear_values(
        spreadsheet_id,
        &format!("{sheet_name}!{start_col}1:{end_col}2"),
    )
    .await?;
    api.update_values(
        spreadsheet_id,
        &format!("{sheet_name}!{start_col}1:{end_col}1"),
        labels,
    )
    .await?;
    api.update_values(
        spreadsheet_id,
        &format!("{sheet_name}!{start_col}2:{end_col}2"),
        values,
    )
    .await?;
    Ok(())
}

/// One-shot sort of the data region by `posted_at`, newest first.
pub async fn sort_by_posted_at(
    api: &dyn SheetsApi,
    spreadsheet_id: &str,
    sheet_name: &str,
    header: &[String],
) -> Result<()> {
    let Some(posted_idx) = header.iter().position(|c| c == "posted_at") else {
        return Ok(());
    };
    api.sort_range(spreadsheet_id, sheet_name, posted_idx, header.len(), true)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> Vec<String> {
        ["post_url", "posted_at", "views", "velocity"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn col_letters() {
        assert_eq!(col_letter(1), "A");
        assert_eq!(col_letter(24), "X");
        assert_eq!(col_letter(26), "Z");
        assert_eq!(col_letter(27), "AA");
        assert_eq!(col_letter(52), "AZ");
    }

    #[test]
    fn sheet_datetime_formula() {
        let dt = DateTime::parse_from_rfc3339("2026-03-05T08:07:06Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(sheet_datetime(dt, "UTC"), "=DATE(2026,3,5)+TIME(8,7,6)");
        // Unknown zones fall back to UTC rather than failing the write.
        assert_eq!(
            sheet_datetime(dt, "Not/AZone"),
            "=DATE(2026,3,5)+TIME(8,7,6)"
        );
    }

    #[test]
    fn migrate_moves_columns_by_name() {
        let legacy: Vec<String> = ["posted_at", "post_url", "views"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let rows = vec![vec![
            "2026-01-01".to_string(),
            "https://x/p/a/".to_string(),
            "120".to_string(),
        ]];
        let migrated = migrate_rows(&legacy, &header(), &rows);
        assert_eq!(
            migrated,
            vec![vec![
                "https://x/p/a/".to_string(),
                "2026-01-01".to_string(),
                "120".to_string(),
                String::new(),
            ]]
        );
    }

    #[test]
    fn migrate_is_idempotent_when_headers_match() {
        let rows = vec![vec![
            "https://x/p/a/".to_string(),
            "2026-01-01".to_string(),
            "120".to_string(),
            "🔥".to_string(),
        ]];
        assert_eq!(migrate_rows(&header(), &header(), &rows), rows);
    }

    #[test]
    fn plan_splits_updates_and_appends() {
        let mut existing = HashMap::new();
        existing.insert("https://x/p/a/".to_string(), 3);

        let known: HashMap<String, String> = [
            ("post_url", "https://x/p/a/"),
            ("views", "9"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let fresh: HashMap<String, String> = [("post_url", "https://x/p/b/")]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        let (updates, appends) =
            plan_row_writes("acme", &header(), &existing, &[known, fresh]);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].range, "acme!A3:D3");
        assert_eq!(updates[0].values[0][2], "9");
        assert_eq!(appends.len(), 1);
        assert_eq!(appends[0][0], "https://x/p/b/");
    }

    #[test]
    fn existing_index_skips_blank_urls() {
        let rows = vec![
            vec!["https://x/p/a/".to_string()],
            vec![String::new()],
            vec!["https://x/p/c/".to_string()],
        ];
        let index = existing_row_index(&header(), &rows);
        assert_eq!(index.get("https://x/p/a/"), Some(&3));
        assert_eq!(index.get("https://x/p/c/"), Some(&5));
        assert_eq!(index.len(), 2);
    }
}
