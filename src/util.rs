//! Small shared helpers.

use regex::Regex;
use std::sync::LazyLock;

static TOKEN_PARAM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(token=)[^&\s]+").expect("valid token regex"));

static SHORTCODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)/(?:p|reel|tv)/([A-Za-z0-9_-]+)").expect("valid url regex"));

/// Strip provider credentials from an error message before it is persisted
/// or logged. The literal token and any `token=` query parameter become
/// `***`.
pub fn sanitize_error(message: &str, token: &str) -> String {
    let mut msg = message.to_string();
    if msg.is_empty() {
        return "Unknown error".to_string();
    }
    if !token.is_empty() {
        msg = msg.replace(token, "***");
    }
    TOKEN_PARAM_RE.replace_all(&msg, "${1}***").into_owned()
}

/// Truncate an error message to the 1000-char limit of the queue tables.
pub fn truncate_error(message: &str) -> String {
    message.chars().take(1000).collect()
}

/// Lowercased shortcode from a post URL (`/p/`, `/reel/`, `/tv/` forms),
/// or empty when the URL has no recognizable code.
pub fn shortcode_from_url(url: &str) -> String {
    let u = url.trim();
    if u.is_empty() {
        return String::new();
    }
    SHORTCODE_RE
        .captures(u)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_lowercase())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_literal_token() {
        let out = sanitize_error("401 for https://api.example.com?token=abc123 secret abc123", "abc123");
        assert!(!out.contains("abc123"));
        assert!(out.contains("token=***"));
    }

    #[test]
    fn sanitize_handles_empty_message() {
        assert_eq!(sanitize_error("", "tok"), "Unknown error");
    }

    #[test]
    fn sanitize_redacts_token_param_case_insensitively() {
        let out = sanitize_error("GET /x?Token=deadbeef&y=1 failed", "");
        assert_eq!(out, "GET /x?Token=***&y=1 failed");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let long = "é".repeat(1500);
        assert_eq!(truncate_error(&long).chars().count(), 1000);
    }

    #[test]
    fn shortcode_extraction() {
        assert_eq!(
            shortcode_from_url("https://www.instagram.com/p/AbC12_-x/"),
            "abc12_-x"
        );
        assert_eq!(
            shortcode_from_url("https://www.instagram.com/reel/XYZ/?utm=1"),
            "xyz"
        );
        assert_eq!(shortcode_from_url("https://example.com/other"), "");
        assert_eq!(shortcode_from_url(""), "");
    }
}
