//! Post lifecycle: checkpoint assignment and stage labeling.
//!
//! Every post moves through observation stages relative to its publish
//! time. Scheduled queue jobs force their checkpoint; ad-hoc scrapes
//! derive it from age.

use crate::data::models::Checkpoint;
use chrono::{DateTime, Utc};

/// Hours elapsed since `posted_at`, never negative.
pub fn age_hours(now: DateTime<Utc>, posted_at: DateTime<Utc>) -> f64 {
    let secs = (now - posted_at).num_seconds() as f64;
    (secs / 3600.0).max(0.0)
}

/// Checkpoint derived from post age when no forced checkpoint applies.
pub fn checkpoint_from_age(age_hours: f64) -> Checkpoint {
    if age_hours < 48.0 {
        Checkpoint::D1
    } else if age_hours < 168.0 {
        Checkpoint::D3
    } else if age_hours < 504.0 {
        Checkpoint::D7
    } else {
        Checkpoint::D21
    }
}

/// User-visible stage label. `D2` means a d1-stage post past its first day.
pub fn stage_label(checkpoint: Checkpoint, age_hours: f64) -> &'static str {
    match checkpoint {
        Checkpoint::D1 => {
            if age_hours < 24.0 {
                "D1"
            } else {
                "D2"
            }
        }
        Checkpoint::D3 => "D3",
        Checkpoint::D7 => "D7",
        Checkpoint::D21 => "D21",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn checkpoint_boundaries() {
        assert_eq!(checkpoint_from_age(0.0), Checkpoint::D1);
        assert_eq!(checkpoint_from_age(47.9), Checkpoint::D1);
        assert_eq!(checkpoint_from_age(48.0), Checkpoint::D3);
        assert_eq!(checkpoint_from_age(167.9), Checkpoint::D3);
        assert_eq!(checkpoint_from_age(168.0), Checkpoint::D7);
        assert_eq!(checkpoint_from_age(503.9), Checkpoint::D7);
        assert_eq!(checkpoint_from_age(504.0), Checkpoint::D21);
    }

    #[test]
    fn stage_labels() {
        assert_eq!(stage_label(Checkpoint::D1, 3.0), "D1");
        assert_eq!(stage_label(Checkpoint::D1, 24.0), "D2");
        assert_eq!(stage_label(Checkpoint::D1, 47.0), "D2");
        assert_eq!(stage_label(Checkpoint::D3, 80.0), "D3");
        assert_eq!(stage_label(Checkpoint::D7, 200.0), "D7");
        assert_eq!(stage_label(Checkpoint::D21, 600.0), "D21");
    }

    #[test]
    fn age_is_clamped_to_zero() {
        let now = Utc::now();
        let future = now + TimeDelta::hours(2);
        assert_eq!(age_hours(now, future), 0.0);
        let past = now - TimeDelta::hours(6);
        assert!((age_hours(now, past) - 6.0).abs() < 1e-9);
    }
}
