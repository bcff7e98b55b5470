/// Tracks the clock-drift offset between a sender's and a receiver's
/// timestamp fields, used to keep the TSBPD time base aligned with the
/// sender's wire timestamps without reacting to a single noisy sample.
///
/// Samples accumulate over a window; once the window fills, the mean is
/// folded into the running drift estimate, and an overdrift beyond
/// `threshold_us` is clamped and reported back to the caller so it can be
/// applied to the TSBPD base time immediately rather than waiting out the
/// next window.
pub struct DriftTracker {
	threshold_us: i64,
	window: u32,
	sum: i64,
	count: u32,
	drift: i64,
}

const DEFAULT_THRESHOLD_US: i64 = 5_000;
const DEFAULT_WINDOW: u32 = 1_000;

impl DriftTracker {
	pub fn new() -> Self {
		Self::with_params(DEFAULT_THRESHOLD_US, DEFAULT_WINDOW)
	}

	pub fn with_params(threshold_us: i64, window: u32) -> Self {
		Self { threshold_us, window, sum: 0, count: 0, drift: 0 }
	}

	/// Record one `(local_us - remote_us)` sample. Returns `Some(shift)` the
	/// instant the window closes and the clamped overdrift should be applied
	/// to the TSBPD base time; `Some` only fires on a window boundary.
	pub fn add_sample(&mut self, sample_us: i64) -> Option<i64> {
		self.sum += sample_us;
		self.count += 1;

		if self.count < self.window {
			return None;
		}

		let mean = self.sum / self.count as i64;
		self.sum = 0;
		self.count = 0;
		self.drift = mean;

		if mean.abs() > self.threshold_us {
			let shift = self.threshold_us * mean.signum();
			self.drift -= shift;
			Some(shift)
		} else {
			None
		}
	}

	/// The latest drift estimate, in microseconds.
	pub fn current(&self) -> i64 {
		self.drift
	}
}

impl Default for DriftTracker {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn converges_within_threshold_for_large_constant_drift() {
		let mut tracker = DriftTracker::with_params(5_000, 10);
		let d = 20_000i64;
		let mut last = None;
		for _ in 0..10 {
			last = tracker.add_sample(d);
		}
		assert!(last.is_some(), "window should have closed and overdrift reported");
		assert!(
			(tracker.current() - d).abs() <= 5_000,
			"drift {} should be within threshold of {d}",
			tracker.current()
		);
	}

	#[test]
	fn small_constant_drift_does_not_overdrift() {
		let mut tracker = DriftTracker::with_params(5_000, 4);
		let d = 100i64;
		let mut shift = None;
		for _ in 0..4 {
			shift = tracker.add_sample(d);
		}
		assert_eq!(shift, None);
		assert_eq!(tracker.current(), d);
	}

	#[test]
	fn no_report_mid_window() {
		let mut tracker = DriftTracker::with_params(5_000, 100);
		for _ in 0..99 {
			assert_eq!(tracker.add_sample(50_000), None);
		}
	}
}
