//! Wall-clock helpers

use chrono::Utc;

/// Current time in milliseconds since the epoch
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Timestamp suitable for archive names: `2026-08-01_13-45-09`
pub fn archive_stamp() -> String {
    Utc::now().format("%Y-%m-%d_%H-%M-%S").to_string()
}
