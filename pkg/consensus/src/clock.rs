use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Monotonic time seam. The consensus module itself never reads a clock; it advances a
/// logical clock from the elapsed durations handed to periodic(). Hosts use one of
/// these to decide when to call periodic and how long to sleep between driver calls.
pub trait Clock: Send + Sync {
	/// Monotonic time since an arbitrary origin fixed at construction
	fn now(&self) -> Duration;

	/// Blocks until now() >= deadline
	fn sleep_until(&self, deadline: Duration);
}

/// Wall clock for real hosts
pub struct SystemClock {
	origin: Instant,
}

impl SystemClock {
	pub fn new() -> SystemClock {
		SystemClock {
			origin: Instant::now(),
		}
	}
}

impl Default for SystemClock {
	fn default() -> Self {
		SystemClock::new()
	}
}

impl Clock for SystemClock {
	fn now(&self) -> Duration {
		self.origin.elapsed()
	}

	fn sleep_until(&self, deadline: Duration) {
		let now = self.now();
		if deadline > now {
			std::thread::sleep(deadline - now);
		}
	}
}

/// Hand-advanced clock for tests; sleep_until simply jumps time forward
pub struct ManualClock {
	now: Mutex<Duration>,
}

impl ManualClock {
	pub fn new() -> ManualClock {
		ManualClock {
			now: Mutex::new(Duration::from_millis(0)),
		}
	}

	pub fn advance(&self, by: Duration) -> Duration {
		let mut now = self.now.lock().unwrap();
		*now += by;
		*now
	}
}

impl Default for ManualClock {
	fn default() -> Self {
		ManualClock::new()
	}
}

impl Clock for ManualClock {
	fn now(&self) -> Duration {
		*self.now.lock().unwrap()
	}

	fn sleep_until(&self, deadline: Duration) {
		let mut now = self.now.lock().unwrap();
		if deadline > *now {
			*now = deadline;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn manual_clock_advances_on_demand() {
		let clock = ManualClock::new();
		assert_eq!(clock.now(), Duration::from_millis(0));

		clock.advance(Duration::from_millis(70));
		assert_eq!(clock.now(), Duration::from_millis(70));

		clock.sleep_until(Duration::from_millis(50));
		assert_eq!(clock.now(), Duration::from_millis(70));

		clock.sleep_until(Duration::from_millis(120));
		assert_eq!(clock.now(), Duration::from_millis(120));
	}
}
