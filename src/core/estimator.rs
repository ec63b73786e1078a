//! Progress percentage and status line derived from raw pipeline counters

use crate::core::models::ProgressEvent;

/// Shown before any comment counts arrive so the UI shows motion
pub const PLACEHOLDER_PERCENT: u8 = 10;
/// Upper bound while a run is still syncing; 100 is reserved for confirmed success
pub const SYNCING_CEILING_PERCENT: u8 = 95;
/// Observed analysis throughput used for the remaining-time hint
const SECONDS_PER_COMMENT: f64 = 1.5;

pub fn estimate(fetched: u64, analyzed: u64) -> u8 {
    if fetched == 0 {
        return PLACEHOLDER_PERCENT;
    }

    let ratio = analyzed as f64 / fetched.max(1) as f64 * 100.0;
    ratio.round().clamp(0.0, SYNCING_CEILING_PERCENT as f64) as u8
}

pub fn estimate_event(event: &ProgressEvent) -> u8 {
    estimate(event.comments_fetched, event.comments_analyzed)
}

/// Minutes left at the observed analysis rate, rounded up
pub fn remaining_minutes(fetched: u64, analyzed: u64) -> u64 {
    let remaining = fetched.saturating_sub(analyzed);
    (remaining as f64 * SECONDS_PER_COMMENT / 60.0).ceil() as u64
}

pub fn status_text(event: &ProgressEvent) -> String {
    if event.comments_fetched > 0 {
        let mins = remaining_minutes(event.comments_fetched, event.comments_analyzed);
        format!(
            "Fetched {} comments from {} posts, ~{mins} min remaining",
            event.comments_fetched, event.posts_fetched
        )
    } else if event.posts_fetched > 0 {
        format!("Fetching comments... {} posts found", event.posts_fetched)
    } else {
        "Connecting to network...".to_string()
    }
}
