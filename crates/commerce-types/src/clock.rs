//! Time source used by every component that stamps or compares timestamps.

use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;

pub trait Clock: Send + Sync {
	fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
	fn now(&self) -> DateTime<Utc> {
		Utc::now()
	}
}

/// A clock that only moves when told to. Used by tests and one-shot sweeps
/// replaying a given instant.
#[derive(Debug)]
pub struct ManualClock {
	now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
	pub fn new(start: DateTime<Utc>) -> Self {
		Self {
			now: Mutex::new(start),
		}
	}

	pub fn advance(&self, by: Duration) {
		let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
		*now += by;
	}

	pub fn set(&self, to: DateTime<Utc>) {
		let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
		*now = to;
	}
}

impl Clock for ManualClock {
	fn now(&self) -> DateTime<Utc> {
		*self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_manual_clock_advances() {
		let start = Utc::now();
		let clock = ManualClock::new(start);
		clock.advance(Duration::minutes(10));
		assert_eq!(clock.now(), start + Duration::minutes(10));
	}
}
