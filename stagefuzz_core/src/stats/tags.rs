//! Naming conventions carried verbatim in stat tags.
//!
//! The recorder never interprets them. External tools use the prefix to
//! decide how to merge a stat across instances and the postfix to pick a
//! unit for display.

use std::time::Duration;

/// Summed across instances.
pub const PREFIX_TOTAL: &str = "total_";
/// Averaged across instances.
pub const PREFIX_AVG: &str = "avg_";

pub const POSTFIX_HEX: &str = "_hex";
pub const POSTFIX_DIR: &str = "_dir";
pub const POSTFIX_EPOCH_S: &str = "_epoch_s";
pub const POSTFIX_NS: &str = "_ns";
pub const POSTFIX_US: &str = "_us";
pub const POSTFIX_MS: &str = "_ms";
pub const POSTFIX_SEC: &str = "_s";
pub const POSTFIX_MIN: &str = "_m";
pub const POSTFIX_HOUR: &str = "_h";

const PREFIXES: &[&str] = &[PREFIX_TOTAL, PREFIX_AVG];

// `_epoch_s` must be tried before `_s`.
const POSTFIXES: &[&str] = &[
    POSTFIX_HEX,
    POSTFIX_DIR,
    POSTFIX_EPOCH_S,
    POSTFIX_NS,
    POSTFIX_US,
    POSTFIX_MS,
    POSTFIX_SEC,
    POSTFIX_MIN,
    POSTFIX_HOUR,
];

/// How a stat is merged across fuzzer instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    Sum,
    Average,
    None,
}

pub fn aggregation_of(tag: &str) -> Aggregation {
    if tag.starts_with(PREFIX_TOTAL) {
        Aggregation::Sum
    } else if tag.starts_with(PREFIX_AVG) {
        Aggregation::Average
    } else {
        Aggregation::None
    }
}

/// The postfix hint of `tag`, if it has one.
pub fn postfix_of(tag: &str) -> Option<&'static str> {
    POSTFIXES.iter().copied().find(|postfix| tag.ends_with(postfix))
}

/// `tag` without its aggregation prefix and unit postfix.
///
/// `total_uptime_epoch_s` becomes `uptime`.
pub fn strip_tag_hints(tag: &str) -> &str {
    let mut stripped = tag;
    if let Some(prefix) = PREFIXES.iter().find(|p| stripped.starts_with(*p)) {
        stripped = &stripped[prefix.len()..];
    }
    if let Some(postfix) = postfix_of(stripped) {
        stripped = &stripped[..stripped.len() - postfix.len()];
    }
    stripped
}

/// Converts a numeric stat to a duration according to its unit postfix.
pub fn duration_of(tag: &str, value: u64) -> Option<Duration> {
    match postfix_of(tag)? {
        POSTFIX_NS => Some(Duration::from_nanos(value)),
        POSTFIX_US => Some(Duration::from_micros(value)),
        POSTFIX_MS => Some(Duration::from_millis(value)),
        POSTFIX_SEC => Some(Duration::from_secs(value)),
        POSTFIX_MIN => Some(Duration::from_secs(value.saturating_mul(60))),
        POSTFIX_HOUR => Some(Duration::from_secs(value.saturating_mul(3600))),
        _ => None,
    }
}

/// Moves a rolling average `cur` towards `new` by `1 / denominator` of the gap.
///
/// A zero denominator resets the average to `new`.
pub fn update_average(cur: u64, new: u64, denominator: u64) -> u64 {
    if denominator == 0 {
        return new;
    }
    if cur > new {
        cur - (cur - new) / denominator
    } else {
        cur + (new - cur) / denominator
    }
}
