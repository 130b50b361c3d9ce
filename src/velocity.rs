//! Cohort-relative velocity classification.
//!
//! A post is ranked against a peer pool drawn from the same handle, the
//! same (loosely matched) media type, and the same checkpoint stage. The
//! ranking is a dense-rank percentile over the pool's unique
//! metric-per-day values, mapped onto a closed emoji tag vocabulary.

use std::cmp::Ordering;
use std::fmt;

/// Sentinel persisted when the peer pool is below the cohort floor.
/// Rendered as an empty cell in the spreadsheet projection.
pub const INSUFFICIENT_DATA: &str = "insufficient_data";

/// The closed velocity tag vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VelocityTag {
    /// 🚀 top 5%
    Rocket,
    /// 🔥 top 15%
    Fire,
    /// ✅ top 35%
    Steady,
    /// 😴 everything below
    Sleeper,
}

impl VelocityTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            VelocityTag::Rocket => "🚀",
            VelocityTag::Fire => "🔥",
            VelocityTag::Steady => "✅",
            VelocityTag::Sleeper => "😴",
        }
    }

    pub fn for_percentile(p: u8) -> VelocityTag {
        match p {
            0..=5 => VelocityTag::Rocket,
            6..=15 => VelocityTag::Fire,
            16..=35 => VelocityTag::Steady,
            _ => VelocityTag::Sleeper,
        }
    }

    pub fn is_hot(&self) -> bool {
        matches!(self, VelocityTag::Rocket | VelocityTag::Fire)
    }
}

/// A tag plus the optional ☘️ late-bloomer prefix.
///
/// The prefix marks a post that was not hot at d1 but is hot at d7; the
/// inner tag and the flag are stored separately, the string projection is
/// what reaches the database and the sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VelocityLabel {
    pub tag: VelocityTag,
    pub late_bloomer: bool,
}

impl VelocityLabel {
    pub fn new(tag: VelocityTag) -> Self {
        Self {
            tag,
            late_bloomer: false,
        }
    }
}

impl fmt::Display for VelocityLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.late_bloomer {
            write!(f, "☘️{}", self.tag.as_str())
        } else {
            f.write_str(self.tag.as_str())
        }
    }
}

/// A stored tag string is "hot" when it carries 🔥 or 🚀 anywhere,
/// including behind the ☘️ prefix.
pub fn is_hot_tag(tag: &str) -> bool {
    tag.contains("🔥") || tag.contains("🚀")
}

/// Outcome of classifying one post at one checkpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Classification {
    /// No usable metric or an empty pool: no percentile, default tag.
    Unranked,
    /// Pool exists but is below the cohort floor.
    InsufficientData,
    Ranked { percentile: u8, label: VelocityLabel },
}

impl Classification {
    /// Tag string persisted to post_signals / checkpoint metrics.
    pub fn signal_tag(&self) -> String {
        match self {
            Classification::Unranked => VelocityTag::Steady.as_str().to_string(),
            Classification::InsufficientData => INSUFFICIENT_DATA.to_string(),
            Classification::Ranked { label, .. } => label.to_string(),
        }
    }

    /// Percentile string persisted alongside the tag ("11%", or empty).
    pub fn percentile_string(&self) -> String {
        match self {
            Classification::Ranked { percentile, .. } => format!("{percentile}%"),
            _ => String::new(),
        }
    }

    /// Tag as rendered in the spreadsheet: the sentinel becomes empty.
    pub fn sheet_tag(&self) -> String {
        match self {
            Classification::InsufficientData => String::new(),
            other => other.signal_tag(),
        }
    }

    pub fn sheet_percentile(&self) -> String {
        match self {
            Classification::InsufficientData => String::new(),
            other => other.percentile_string(),
        }
    }

    pub fn is_hot(&self) -> bool {
        matches!(
            self,
            Classification::Ranked { label, .. } if label.tag.is_hot()
        )
    }
}

/// Media-type aware metric selection.
///
/// video/reel count views; sidecar/carousel weight comments double on top
/// of likes; everything else falls back to likes.
pub fn metric_value(
    media_type: &str,
    views: Option<i32>,
    likes: Option<i32>,
    comments: Option<i32>,
) -> f64 {
    let m = media_type.to_lowercase();
    if m.contains("video") || m.contains("reel") {
        return f64::from(views.unwrap_or(0));
    }
    if m.contains("sidecar") || m.contains("carousel") {
        return f64::from(likes.unwrap_or(0)) + 2.0 * f64::from(comments.unwrap_or(0));
    }
    f64::from(likes.unwrap_or(0))
}

/// Loose media type match: substring in either direction, empty matches
/// everything. Keeps "Video" pooled with "video_reel" style variants.
pub fn media_type_matches(wanted: &str, stored: &str) -> bool {
    let a = wanted.to_lowercase();
    let b = stored.to_lowercase();
    if a.is_empty() || b.is_empty() {
        return true;
    }
    a.contains(&b) || b.contains(&a)
}

/// Dense-rank percentile over the pool's unique values, descending.
///
/// The rank is the 1-based index of the first unique value `<= value`;
/// ties share rank. A single-value pool yields 50%. 1% is the top
/// performer.
pub fn dense_rank_percentile(pool: &[f64], value: f64) -> Option<u8> {
    if pool.is_empty() {
        return None;
    }
    let mut uniq = pool.to_vec();
    uniq.sort_by(|a, b| b.partial_cmp(a).unwrap_or(Ordering::Equal));
    uniq.dedup();
    let u = uniq.len();
    if u == 1 {
        return Some(50);
    }
    let rank = uniq
        .iter()
        .position(|v| value >= *v)
        .map(|i| i + 1)
        .unwrap_or(u);
    let p = (1.0 + ((rank - 1) as f64) * 99.0 / ((u - 1) as f64)).round();
    Some(p.clamp(1.0, 100.0) as u8)
}

/// Classify one metric-per-day value against its peer pool.
///
/// Late-bloomer detection needs snapshot history and is layered on by the
/// caller (see [`crate::lifecycle`]).
pub fn classify(pool: &[f64], metric_per_day: f64, min_cohort: usize) -> Classification {
    if pool.is_empty() {
        return Classification::Unranked;
    }
    if pool.len() < min_cohort {
        return Classification::InsufficientData;
    }
    match dense_rank_percentile(pool, metric_per_day) {
        None => Classification::Unranked,
        Some(percentile) => Classification::Ranked {
            percentile,
            label: VelocityLabel::new(VelocityTag::for_percentile(percentile)),
        },
    }
}
