pub mod about;
pub mod comments;
pub mod listing;

use chrono::{DateTime, NaiveDateTime};

/// Converts Reddit's fractional `created_utc` seconds.
pub fn naive_from_epoch(secs: f64) -> Option<NaiveDateTime> {
    if !secs.is_finite() {
        return None;
    }
    let whole = secs.trunc() as i64;
    let nanos = ((secs - secs.trunc()) * 1e9).round().clamp(0.0, 999_999_999.0) as u32;
    DateTime::from_timestamp(whole, nanos).map(|dt| dt.naive_utc())
}

/// `[deleted]` and empty authors carry no identity.
pub fn normalize_author(author: Option<String>) -> Option<String> {
    author
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty() && a != "[deleted]" && a != "[removed]")
}
