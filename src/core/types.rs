//! Common types used across the parameter server.

use std::time::Duration;

/// Timestamp wrapper for consistent serialization.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Monotonic round counter, starting at 0 for the first round.
pub type RoundId = u64;

/// Get current UTC timestamp.
pub fn now() -> Timestamp {
    chrono::Utc::now()
}

/// Convert an optional millisecond setting into a timeout.
///
/// `None` and `Some(0)` both mean "wait forever".
pub fn timeout_from_millis(ms: Option<u64>) -> Option<Duration> {
    match ms {
        Some(0) | None => None,
        Some(ms) => Some(Duration::from_millis(ms)),
    }
}
