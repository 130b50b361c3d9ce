//! Row structs and small domain enums shared across the data layer.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

/// Observation stage of a post, relative to `posted_at`.
///
/// `d1` covers the first 48 hours (stage label `D1` before 24h, `D2`
/// after); the remaining checkpoints fire at their scheduled offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Checkpoint {
    D1,
    D3,
    D7,
    D21,
}

impl Checkpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Checkpoint::D1 => "d1",
            Checkpoint::D3 => "d3",
            Checkpoint::D7 => "d7",
            Checkpoint::D21 => "d21",
        }
    }

    pub fn parse(s: &str) -> Option<Checkpoint> {
        match s {
            "d1" => Some(Checkpoint::D1),
            "d3" => Some(Checkpoint::D3),
            "d7" => Some(Checkpoint::D7),
            "d21" => Some(Checkpoint::D21),
            _ => None,
        }
    }

    /// Divisor for metric-per-day velocity at this checkpoint.
    pub fn days(&self) -> f64 {
        match self {
            Checkpoint::D1 => 1.0,
            Checkpoint::D3 => 3.0,
            Checkpoint::D7 => 7.0,
            Checkpoint::D21 => 21.0,
        }
    }

    /// Minimum peer pool size before a percentile is emitted.
    ///
    /// D1 and D2 both rank against d1 snapshot data, which accumulates
    /// faster, hence the lower floor.
    pub fn min_cohort_size(&self) -> usize {
        match self {
            Checkpoint::D1 => 12,
            _ => 20,
        }
    }

    /// Snapshot column names `(at, views, likes, comments)` for this stage.
    pub fn snapshot_columns(&self) -> (&'static str, &'static str, &'static str, &'static str) {
        match self {
            Checkpoint::D1 => ("d1_at", "d1_views", "d1_likes", "d1_comments"),
            Checkpoint::D3 => ("d3_at", "d3_views", "d3_likes", "d3_comments"),
            Checkpoint::D7 => ("d7_at", "d7_views", "d7_likes", "d7_comments"),
            Checkpoint::D21 => ("d21_at", "d21_views", "d21_likes", "d21_comments"),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Subscriber {
    pub id: i64,
    pub name: String,
    pub spreadsheet_id: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct Feed {
    pub id: i64,
    pub subscriber_id: i64,
    pub name: String,
    pub mode: String,
    pub max_feeders: i32,
    pub status: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct Feeder {
    pub id: i64,
    pub feed_id: i64,
    pub handle: String,
    pub role: String,
    pub status: String,
}

/// A claimed row from the handle scrape queue.
#[derive(Debug, Clone, FromRow)]
pub struct HandleJob {
    pub id: i64,
    pub subscriber_id: i64,
    pub spreadsheet_id: Option<String>,
    pub handle: String,
    pub run_type: String,
    pub status: String,
    pub attempt: i32,
    pub next_run_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// A claimed row from the per-post checkpoint queue.
#[derive(Debug, Clone, FromRow)]
pub struct PostJob {
    pub id: i64,
    pub subscriber_id: i64,
    pub spreadsheet_id: Option<String>,
    pub handle: String,
    pub post_url: String,
    pub checkpoint: String,
    pub requires_d7_hot: bool,
    pub attempt: i32,
    pub next_run_at: DateTime<Utc>,
    pub status: String,
    pub last_error: Option<String>,
}

/// One post's full snapshot row: four nullable checkpoint triples.
#[derive(Debug, Clone, Default, FromRow)]
pub struct PostSnapshot {
    pub subscriber_id: i64,
    pub handle: String,
    pub post_url: String,
    pub media_type: Option<String>,
    pub posted_at: Option<DateTime<Utc>>,
    pub d1_at: Option<DateTime<Utc>>,
    pub d1_views: Option<i32>,
    pub d1_likes: Option<i32>,
    pub d1_comments: Option<i32>,
    pub d3_at: Option<DateTime<Utc>>,
    pub d3_views: Option<i32>,
    pub d3_likes: Option<i32>,
    pub d3_comments: Option<i32>,
    pub d7_at: Option<DateTime<Utc>>,
    pub d7_views: Option<i32>,
    pub d7_likes: Option<i32>,
    pub d7_comments: Option<i32>,
    pub d21_at: Option<DateTime<Utc>>,
    pub d21_views: Option<i32>,
    pub d21_likes: Option<i32>,
    pub d21_comments: Option<i32>,
}

impl PostSnapshot {
    /// The `(views, likes, comments)` triple stored for a checkpoint.
    pub fn triple(&self, checkpoint: Checkpoint) -> (Option<i32>, Option<i32>, Option<i32>) {
        match checkpoint {
            Checkpoint::D1 => (self.d1_views, self.d1_likes, self.d1_comments),
            Checkpoint::D3 => (self.d3_views, self.d3_likes, self.d3_comments),
            Checkpoint::D7 => (self.d7_views, self.d7_likes, self.d7_comments),
            Checkpoint::D21 => (self.d21_views, self.d21_likes, self.d21_comments),
        }
    }

    /// Whether any component of a checkpoint triple has been observed.
    pub fn has_observation(&self, checkpoint: Checkpoint) -> bool {
        let (v, l, c) = self.triple(checkpoint);
        v.is_some() || l.is_some() || c.is_some()
    }
}

/// Post signal row joined with the latest checkpoint counters, as consumed
/// by the embeddings pass.
#[derive(Debug, Clone, FromRow)]
pub struct SignalPost {
    pub subscriber_id: i64,
    pub feed_id: Option<i64>,
    pub feeder_id: Option<i64>,
    pub handle: String,
    pub post_url: String,
    pub media_type: Option<String>,
    pub posted_at: Option<DateTime<Utc>>,
    pub caption: Option<String>,
    pub velocity_tag: Option<String>,
    pub velocity_stage: Option<String>,
    pub velocity_percentile: Option<String>,
    pub views: i32,
    pub likes: i32,
    pub comments: i32,
}

/// Current signal fields for one post, keyed by sheet shortcode during
/// projection repair.
#[derive(Debug, Clone, FromRow)]
pub struct PostSignalFields {
    pub post_url: String,
    pub velocity_tag: Option<String>,
    pub velocity_percentile: Option<String>,
    pub velocity_stage: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_round_trips() {
        for cp in [Checkpoint::D1, Checkpoint::D3, Checkpoint::D7, Checkpoint::D21] {
            assert_eq!(Checkpoint::parse(cp.as_str()), Some(cp));
        }
        assert_eq!(Checkpoint::parse("d2"), None);
    }

    #[test]
    fn cohort_floor_is_lower_for_d1() {
        assert_eq!(Checkpoint::D1.min_cohort_size(), 12);
        assert_eq!(Checkpoint::D7.min_cohort_size(), 20);
        assert_eq!(Checkpoint::D21.min_cohort_size(), 20);
    }

    #[test]
    fn snapshot_triple_access() {
        let snap = PostSnapshot {
            d7_views: Some(100),
            ..Default::default()
        };
        assert!(snap.has_observation(Checkpoint::D7));
        assert!(!snap.has_observation(Checkpoint::D1));
        assert_eq!(snap.triple(Checkpoint::D7), (Some(100), None, None));
    }
}
