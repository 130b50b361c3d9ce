//! Configuration module for the feedpulse worker.
//!
//! Configuration is loaded from environment variables via figment. Duration
//! fields accept both numeric values (interpreted as seconds) and duration
//! strings with units ("30s", "15m").

use fundu::{DurationParser, TimeUnit};
use serde::{Deserialize, Deserializer};
use std::time::Duration;

/// Main application configuration.
#[derive(Deserialize, Clone)]
pub struct Config {
    /// Log level for this crate's target specifically.
    ///
    /// Valid values are: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Database connection URL
    pub database_url: String,
    /// Spreadsheet backing the default subscriber
    pub spreadsheet_id: String,
    /// IANA timezone used when rendering spreadsheet datetimes
    #[serde(default = "default_tz")]
    pub tz: String,

    /// Scraping provider API token
    pub apify_token: String,
    /// Scraping provider actor to run
    pub apify_actor_id: String,
    /// Upper bound on items requested per run
    #[serde(default = "default_apify_max_items")]
    pub apify_max_items: i64,
    /// Wall-clock bound on a single actor run
    #[serde(
        default = "default_apify_run_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub apify_run_timeout: Duration,
    /// Interval between run status polls
    #[serde(
        default = "default_apify_poll_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub apify_poll_interval: Duration,

    /// Input template for the daily posts scrape ({handle} substituted)
    #[serde(default = "default_template_daily")]
    pub apify_input_template_daily: String,
    /// Input template for the weekly scrape; falls back to the daily template
    #[serde(default)]
    pub apify_input_template_weekly: Option<String>,
    /// Input template for profile details ({handle} substituted)
    #[serde(default = "default_template_details")]
    pub apify_input_template_details: String,
    /// Input template for single-post refreshes ({post_url} substituted)
    #[serde(default = "default_template_post_url")]
    pub apify_input_template_post_url: String,

    /// Comma list of minutes for the retry backoff schedule
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_minutes: String,
    /// Consecutive provider failures before the circuit breaker opens
    #[serde(default = "default_cooldown_trigger")]
    pub apify_cooldown_trigger_failures: i32,
    /// Hours the breaker stays open once triggered
    #[serde(default = "default_cooldown_hours")]
    pub apify_cooldown_hours: i32,
    /// Post checkpoint jobs claimed per batch
    #[serde(default = "default_post_batch_size")]
    pub post_batch_size: i64,

    /// Spreadsheet tab names that are never treated as handles
    #[serde(default = "default_ignore_sheets")]
    pub ignore_sheets: String,
    /// Pipe- or comma-delimited sheet header columns
    #[serde(default = "default_sheet_header")]
    pub sheet_header: String,
    /// Pipe- or comma-delimited column descriptions (row 2)
    #[serde(default = "default_sheet_descriptions")]
    pub sheet_descriptions: String,
    /// Bearer token for the spreadsheet values API
    #[serde(default)]
    pub sheets_token: String,
    /// Base URL for the spreadsheet values API
    #[serde(default = "default_sheets_base_url")]
    pub sheets_base_url: String,

    /// API key for the embeddings service
    #[serde(default)]
    pub embedding_api_key: String,
    /// Base URL for the embeddings service
    #[serde(default = "default_embedding_base_url")]
    pub embedding_base_url: String,
    /// Optional referer header for routed embedding providers
    #[serde(default)]
    pub embedding_site_url: String,
    /// Optional app-name header for routed embedding providers
    #[serde(default = "default_embedding_app_name")]
    pub embedding_app_name: String,
    /// Embedding model identifier
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    /// Only posts carrying one of these tags are embedded
    #[serde(default = "default_embed_only_tags")]
    pub embed_only_tags: String,
    /// Maximum signal rows embedded per subscriber per pass
    #[serde(default = "default_embed_batch_limit")]
    pub embed_batch_limit: i64,
    /// Signal text variants to embed per post
    #[serde(default = "default_embed_signal_types")]
    pub embed_signal_types: String,
}

impl Config {
    /// Backoff schedule in minutes; a job whose attempt count exceeds the
    /// schedule length fails terminally.
    pub fn retry_backoff(&self) -> Vec<i64> {
        let parsed: Vec<i64> = self
            .retry_backoff_minutes
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect();
        if parsed.is_empty() { vec![15] } else { parsed }
    }

    pub fn apify_input_template_weekly(&self) -> &str {
        self.apify_input_template_weekly
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(&self.apify_input_template_daily)
    }

    pub fn ignore_sheets(&self) -> Vec<String> {
        parse_env_list(&self.ignore_sheets)
    }

    pub fn embed_only_tags(&self) -> Vec<String> {
        parse_env_list(&self.embed_only_tags)
    }

    pub fn embed_signal_types(&self) -> Vec<String> {
        parse_env_list(&self.embed_signal_types)
    }

    /// Header columns with descriptions padded/truncated to the same length.
    pub fn sheet_schema(&self) -> (Vec<String>, Vec<String>) {
        let header = parse_env_list(&self.sheet_header);
        let mut descriptions = parse_env_list(&self.sheet_descriptions);
        descriptions.resize(header.len(), String::new());
        (header, descriptions)
    }
}

/// Parse a delimited env value into a list.
///
/// Accepts a JSON array, a pipe-delimited string, or a comma-delimited
/// string, in that order of preference.
pub fn parse_env_list(value: &str) -> Vec<String> {
    let raw = value.trim();
    if raw.is_empty() {
        return Vec::new();
    }
    if raw.starts_with('[') {
        if let Ok(serde_json::Value::Array(items)) = serde_json::from_str(raw) {
            return items
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
    }
    let sep = if raw.contains('|') { '|' } else { ',' };
    raw.split(sep)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_tz() -> String {
    "UTC".to_string()
}

fn default_apify_max_items() -> i64 {
    100
}

/// Default run timeout of 15 minutes
fn default_apify_run_timeout() -> Duration {
    Duration::from_secs(900)
}

/// Default poll interval of 10 seconds
fn default_apify_poll_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_template_daily() -> String {
    r#"{"addParentData":false,"directUrls":["https://www.instagram.com/{handle}/"],"onlyPostsNewerThan":"3 days","resultsLimit":100,"resultsType":"posts","searchType":"user"}"#.to_string()
}

fn default_template_details() -> String {
    r#"{"addParentData":false,"directUrls":["https://www.instagram.com/{handle}/"],"resultsLimit":1,"resultsType":"details","searchType":"user"}"#.to_string()
}

fn default_template_post_url() -> String {
    r#"{"addParentData":false,"directUrls":["{post_url}"],"resultsLimit":1,"resultsType":"posts"}"#.to_string()
}

/// Default backoff of six 15-minute slots
fn default_retry_backoff() -> String {
    "15,15,15,15,15,15".to_string()
}

fn default_cooldown_trigger() -> i32 {
    5
}

fn default_cooldown_hours() -> i32 {
    3
}

fn default_post_batch_size() -> i64 {
    10
}

fn default_ignore_sheets() -> String {
    "Config,Logs,README".to_string()
}

fn default_sheet_header() -> String {
    "post_url|posted_at|handle|display_name|media_type|is_pinned|views|likes|comments|perf_score|velocity|velocity_percentile|velocity_stage|caption|hashtags|caption_mentions|tagged_users|music_info|paid_partnership|sponsors|display_url|video_url|scanned_at|last_updated_at".to_string()
}

fn default_sheet_descriptions() -> String {
    "Unique link to post (do not edit)|Post date/time (DD-MM-YY hh:mm AM/PM)|Handle|Display name|Format: Video / Image / Sidecar (carousel)|Whether pinned by creator|Total views (Reels)|Total likes|Total comments|Engagement rate percent|Velocity emoji from percentile bands|Velocity percentile rank within same-checkpoint cohort (1% = top performer)|Velocity stage (D1 post added, D2 next-day update, D3 checkpoint, D7 gate, D21 final)|Post caption text|Hashtags comma separated|Mentions found in caption|Users tagged in post|Music used short|Whether post is a paid partnership|Brands involved or sponsors|Thumbnail preview link|Video file link (Reels)|When system scanned this post|When this row was last updated".to_string()
}

fn default_sheets_base_url() -> String {
    "https://sheets.googleapis.com/v4/spreadsheets".to_string()
}

fn default_embedding_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_embedding_app_name() -> String {
    "feedpulse-worker".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_embed_only_tags() -> String {
    "🔥,🚀".to_string()
}

fn default_embed_batch_limit() -> i64 {
    100
}

fn default_embed_signal_types() -> String {
    "caption_semantic,performance_semantic".to_string()
}

/// Duration parser handling seconds (default), milliseconds, and minutes.
///
/// Allows whitespace between the number and the unit and multiple summed
/// units ("10s 2m" = 130 seconds). Fractions, exponents and infinity are
/// rejected.
const DURATION_PARSER: DurationParser<'static> = DurationParser::builder()
    .time_units(&[TimeUnit::Second, TimeUnit::MilliSecond, TimeUnit::Minute])
    .parse_multiple(None)
    .allow_time_unit_delimiter()
    .disable_infinity()
    .disable_fraction()
    .disable_exponent()
    .default_unit(TimeUnit::Second)
    .build();

/// Custom deserializer for duration fields that accepts both numeric and
/// string values.
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Visitor;

    struct DurationVisitor;

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a duration string or number")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            DURATION_PARSER
                .parse(value)
                .map_err(|e| {
                    serde::de::Error::custom(format!(
                        "Invalid duration format '{}': {}. Examples: '5' (5 seconds), '3500ms', '30s', '2m'",
                        value, e
                    ))
                })?
                .try_into()
                .map_err(|e| serde::de::Error::custom(format!("Duration conversion error: {}", e)))
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(Duration::from_secs(value))
        }

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            if value < 0 {
                return Err(serde::de::Error::custom("Duration cannot be negative"));
            }
            Ok(Duration::from_secs(value as u64))
        }
    }

    deserializer.deserialize_any(DurationVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_env_list_pipe_delimited() {
        assert_eq!(
            parse_env_list("post_url|posted_at| handle "),
            vec!["post_url", "posted_at", "handle"]
        );
    }

    #[test]
    fn parse_env_list_comma_delimited() {
        assert_eq!(parse_env_list("a, b,,c"), vec!["a", "b", "c"]);
    }

    #[test]
    fn parse_env_list_json_array() {
        assert_eq!(parse_env_list(r#"["x","y"]"#), vec!["x", "y"]);
    }

    #[test]
    fn parse_env_list_empty() {
        assert!(parse_env_list("  ").is_empty());
    }
}
