//! Helpers shared by the handlers and the engine.

use chrono::Duration;

/// Longest configurable period: one hundred years.
const MAX_SECONDS: u64 = 100 * 365 * 86_400;

/// Converts a configured number of seconds into a chrono duration, capped so
/// that adding it to a timestamp cannot overflow.
pub fn seconds(secs: u64) -> Duration {
	Duration::seconds(secs.min(MAX_SECONDS) as i64)
}
