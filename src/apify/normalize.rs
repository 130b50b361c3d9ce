//! Normalization of raw provider items.
//!
//! The provider returns loosely-shaped records whose field names drift
//! between actor versions. Everything downstream consumes the fixed
//! [`NormalizedPost`] produced here; raw shapes never escape this module.

use chrono::{DateTime, Utc};
use serde_json::Value;

/// A provider item collapsed to the fields the pipeline cares about.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedPost {
    pub post_url: String,
    pub posted_at: Option<DateTime<Utc>>,
    pub handle: String,
    pub display_name: String,
    pub followers_at_scan: Option<i64>,
    pub media_type: String,
    pub is_pinned: bool,
    pub views: Option<i32>,
    pub likes: Option<i32>,
    pub comments: Option<i32>,
    pub caption: String,
    pub hashtags: String,
    pub caption_mentions: String,
    pub display_url: String,
    pub video_url: String,
    pub tagged_users: String,
    pub music_info: String,
    pub duration_seconds: Option<f64>,
    pub paid_partnership: bool,
    pub sponsors: String,
}

impl NormalizedPost {
    pub fn from_item(item: &Value) -> NormalizedPost {
        let caption = pick_str(item, &["caption", "text", "description"]).unwrap_or_default();

        let handle = pick_str(item, &["ownerUsername", "username"])
            .or_else(|| nested_str(item, "owner", "username"))
            .unwrap_or_default();
        let display_name = pick_str(item, &["ownerFullName", "fullName"])
            .or_else(|| nested_str(item, "owner", "fullName"))
            .unwrap_or_default();
        let followers = pick_count(item, &["ownerFollowersCount", "followersCount"])
            .or_else(|| {
                item.pointer("/owner/followersCount")
                    .and_then(value_to_count)
            })
            .or_else(|| {
                item.pointer("/owner/edge_followed_by/count")
                    .and_then(value_to_count)
            });

        let post_url = pick_str(item, &["url"]).unwrap_or_else(|| {
            pick_str(item, &["shortCode", "shortcode", "code"])
                .map(|code| format!("https://www.instagram.com/p/{code}/"))
                .unwrap_or_default()
        });

        let views = pick_count(item, &["videoViewCount", "videoPlayCount", "views", "viewCount"]);
        let likes = pick_count(item, &["likesCount", "likes", "likeCount"]);
        let comments = pick_count(item, &["commentsCount", "comments", "commentCount"]);

        NormalizedPost {
            post_url,
            posted_at: pick(item, &["timestamp", "takenAtTimestamp", "takenAt", "createdAt"])
                .and_then(parse_timestamp),
            handle,
            display_name,
            followers_at_scan: followers.map(i64::from).map(|v| v.max(0)),
            media_type: pick_str(item, &["type", "mediaType"]).unwrap_or_default(),
            is_pinned: pick_bool(item, &["isPinned", "pinned"]),
            views: views.map(|v| v.max(0)),
            likes: likes.map(|v| v.max(0)),
            comments: comments.map(|v| v.max(0)),
            hashtags: extract_prefixed(&caption, '#'),
            caption_mentions: extract_prefixed(&caption, '@'),
            caption,
            display_url: pick_str(item, &["displayUrl", "thumbnailUrl"]).unwrap_or_default(),
            video_url: pick_str(item, &["videoUrl", "videoUrlHd"]).unwrap_or_default(),
            tagged_users: tagged_users(pick(item, &["taggedUsers", "userTags", "tagged"])),
            music_info: list_to_csv(pick(item, &["musicInfo", "music"])),
            duration_seconds: pick(
                item,
                &["videoDuration", "duration", "videoDurationSeconds"],
            )
            .and_then(value_to_f64),
            paid_partnership: pick_bool(item, &["isPaidPartnership", "isPaid", "isCommercial"]),
            sponsors: list_to_csv(pick(item, &["sponsors", "brands"])),
        }
    }
}

/// First present, non-null value among the candidate keys.
fn pick<'a>(item: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| item.get(k))
        .find(|v| !v.is_null())
}

fn pick_str(item: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| item.get(k))
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

fn nested_str(item: &Value, outer: &str, inner: &str) -> Option<String> {
    item.get(outer)
        .and_then(|o| o.get(inner))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn pick_count(item: &Value, keys: &[&str]) -> Option<i32> {
    keys.iter()
        .filter_map(|k| item.get(k))
        .find_map(value_to_count)
}

fn pick_bool(item: &Value, keys: &[&str]) -> bool {
    pick(item, keys).is_some_and(|v| match v {
        Value::Bool(b) => *b,
        Value::String(s) => s.eq_ignore_ascii_case("true"),
        Value::Number(n) => n.as_i64().unwrap_or(0) != 0,
        _ => false,
    })
}

fn value_to_count(value: &Value) -> Option<i32> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(|v| i32::try_from(v).ok()),
        Value::String(s) => s.trim().parse::<i32>().ok(),
        _ => None,
    }
}

fn value_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Parse a post timestamp: numeric epoch seconds (or milliseconds, which
/// some actors emit), or an RFC3339-ish string.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let mut ts = n.as_f64()?;
            if ts > 1_000_000_000_000.0 {
                ts /= 1000.0;
            }
            DateTime::from_timestamp(ts as i64, 0)
        }
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return None;
            }
            if let Ok(ts) = s.parse::<f64>() {
                let secs = if ts > 1_000_000_000_000.0 {
                    ts / 1000.0
                } else {
                    ts
                };
                return DateTime::from_timestamp(secs as i64, 0);
            }
            DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
                .or_else(|| {
                    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
                        .or_else(|_| {
                            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                        })
                        .map(|naive| naive.and_utc())
                        .ok()
                })
        }
        _ => None,
    }
}

/// Words starting with the marker, deduplicated, order preserved,
/// comma-joined without the marker.
fn extract_prefixed(text: &str, marker: char) -> String {
    let mut seen = std::collections::HashSet::new();
    let mut out: Vec<&str> = Vec::new();
    for word in text.split_whitespace() {
        if let Some(tag) = word.strip_prefix(marker)
            && !tag.is_empty()
            && seen.insert(tag)
        {
            out.push(tag);
        }
    }
    out.join(",")
}

/// Tagged users come as objects, strings, or a single object; render as
/// one `@name` per line.
fn tagged_users(value: Option<&Value>) -> String {
    fn one(v: &Value) -> Option<String> {
        match v {
            Value::Object(_) => {
                let name = v
                    .get("username")
                    .and_then(Value::as_str)
                    .or_else(|| v.pointer("/user/username").and_then(Value::as_str))
                    .or_else(|| v.get("full_name").and_then(Value::as_str))
                    .or_else(|| v.get("fullName").and_then(Value::as_str))?;
                Some(format!("@{name}"))
            }
            Value::String(s) if !s.is_empty() => Some(if s.starts_with('@') {
                s.clone()
            } else {
                format!("@{s}")
            }),
            _ => None,
        }
    }

    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(one)
            .collect::<Vec<_>>()
            .join("\n"),
        Some(v) => one(v).unwrap_or_default(),
        None => String::new(),
    }
}

fn list_to_csv(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .collect::<Vec<_>>()
            .join(","),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn collapses_alternative_field_names() {
        let item = json!({
            "ownerUsername": "acme",
            "takenAtTimestamp": 1_700_000_000,
            "videoPlayCount": 1234,
            "likes": 56,
            "commentCount": 7,
            "mediaType": "Video",
            "url": "https://www.instagram.com/p/abc/",
        });
        let norm = NormalizedPost::from_item(&item);
        assert_eq!(norm.handle, "acme");
        assert_eq!(norm.views, Some(1234));
        assert_eq!(norm.likes, Some(56));
        assert_eq!(norm.comments, Some(7));
        assert_eq!(norm.media_type, "Video");
        assert_eq!(norm.posted_at.unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn handle_falls_back_to_nested_owner() {
        let item = json!({
            "owner": {"username": "nested", "followersCount": 42},
            "shortCode": "XyZ",
        });
        let norm = NormalizedPost::from_item(&item);
        assert_eq!(norm.handle, "nested");
        assert_eq!(norm.followers_at_scan, Some(42));
        assert_eq!(norm.post_url, "https://www.instagram.com/p/XyZ/");
    }

    #[test]
    fn millisecond_timestamps_are_normalized() {
        let item = json!({"timestamp": 1_700_000_000_000i64});
        let norm = NormalizedPost::from_item(&item);
        assert_eq!(norm.posted_at.unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn rfc3339_timestamps_parse() {
        let item = json!({"createdAt": "2025-03-01T10:30:00Z"});
        let norm = NormalizedPost::from_item(&item);
        assert_eq!(
            norm.posted_at.unwrap().to_rfc3339(),
            "2025-03-01T10:30:00+00:00"
        );
    }

    #[test]
    fn caption_tags_and_mentions_deduplicate() {
        let item = json!({
            "caption": "new drop #launch #launch #summer with @alice and @bob @alice"
        });
        let norm = NormalizedPost::from_item(&item);
        assert_eq!(norm.hashtags, "launch,summer");
        assert_eq!(norm.caption_mentions, "alice,bob");
    }

    #[test]
    fn tagged_users_render_one_per_line() {
        let item = json!({
            "taggedUsers": [
                {"username": "alice"},
                {"user": {"username": "bob"}},
                "carol",
            ]
        });
        let norm = NormalizedPost::from_item(&item);
        assert_eq!(norm.tagged_users, "@alice\n@bob\n@carol");
    }

    #[test]
    fn missing_counters_stay_none() {
        let norm = NormalizedPost::from_item(&json!({"url": "https://x/p/a/"}));
        assert_eq!(norm.views, None);
        assert_eq!(norm.likes, None);
        assert_eq!(norm.comments, None);
        assert!(norm.posted_at.is_none());
    }

    #[test]
    fn flags_accept_string_forms() {
        let item = json!({"isPinned": "true", "isPaidPartnership": false});
        let norm = NormalizedPost::from_item(&item);
        assert!(norm.is_pinned);
        assert!(!norm.paid_partnership);
    }
}
