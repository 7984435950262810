//! Lightweight metrics helpers.

use std::time::Duration;

/// Blocks between the observed head and the last indexed block.
pub fn lag_to_head(head_seen: Option<u64>, last_indexed: Option<u64>) -> Option<u64> {
    match (head_seen, last_indexed) {
        (Some(head), Some(indexed)) => Some(head.saturating_sub(indexed)),
        _ => None,
    }
}

pub fn rate_per_sec(count: u64, elapsed: Duration) -> Option<f64> {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        Some(count as f64 / secs)
    } else {
        None
    }
}

/// Length of a half-open block range `[start, end)`.
pub fn span_len(start: u64, end: u64) -> u64 {
    end.saturating_sub(start)
}
