//! Clock abstraction.
//!
//! Components never read the system time directly; one clock handle is passed
//! to each of them at construction so that timestamps and expiry are
//! deterministic under test.

use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;

/// Source of the current time.
pub trait Clock: Send + Sync {
	fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
	fn now(&self) -> DateTime<Utc> {
		Utc::now()
	}
}

/// Clock that only moves when told to.
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

	/// Moves the clock forward by `by`.
	pub fn advance(&self, by: Duration) {
		let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
		*now += by;
	}

	pub fn set(&self, to: DateTime<Utc>) {
		*self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
	}
}

impl Default for ManualClock {
	fn default() -> Self {
		Self::new(DateTime::<Utc>::UNIX_EPOCH + Duration::days(20_000))
	}
}

impl Clock for ManualClock {
	fn now(&self) -> DateTime<Utc> {
		*self.now.lock().unwrap_or_else(|e| e.into_inner())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_manual_clock_advances() {
		let clock = ManualClock::default();
		let start = clock.now();
		clock.advance(Duration::seconds(90));
		assert_eq!(clock.now() - start, Duration::seconds(90));
	}
}
