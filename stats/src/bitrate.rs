/// Moving-average input-bitrate estimator on the send side: a short
/// "fast-start" window gives a usable estimate almost immediately after
/// a connection opens, then the window widens for a steadier long-run
/// figure.
const FAST_START_WINDOW_US: u64 = 500_000;
const RUNNING_WINDOW_US: u64 = 1_000_000;

pub struct BitrateEstimator {
	window_us: u64,
	fast_start: bool,
	bucket_start_us: u64,
	bucket_bytes: u64,
	rate_bytes_per_sec: f64,
}

impl BitrateEstimator {
	pub fn new(now_us: u64) -> Self {
		BitrateEstimator { window_us: FAST_START_WINDOW_US, fast_start: true, bucket_start_us: now_us, bucket_bytes: 0, rate_bytes_per_sec: 0.0 }
	}

	/// Record `payload_bytes` sent at `now_us`, closing and folding in the
	/// current window if it has elapsed.
	pub fn record(&mut self, now_us: u64, payload_bytes: u64) {
		self.bucket_bytes += payload_bytes;
		self.maybe_close_window(now_us);
	}

	/// Close the current window even with no new data, so the rate decays
	/// toward zero during a send gap instead of reporting a stale figure.
	pub fn tick(&mut self, now_us: u64) {
		self.maybe_close_window(now_us);
	}

	fn maybe_close_window(&mut self, now_us: u64) {
		let elapsed = now_us.saturating_sub(self.bucket_start_us);
		if elapsed < self.window_us {
			return;
		}

		self.rate_bytes_per_sec = self.bucket_bytes as f64 * 1_000_000.0 / elapsed as f64;
		self.bucket_bytes = 0;
		self.bucket_start_us = now_us;

		if self.fast_start {
			self.fast_start = false;
			self.window_us = RUNNING_WINDOW_US;
		}
	}

	pub fn bytes_per_second(&self) -> f64 {
		self.rate_bytes_per_sec
	}

	pub fn bits_per_second(&self) -> f64 {
		self.rate_bytes_per_sec * 8.0
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fast_start_window_reports_after_half_a_second() {
		let mut est = BitrateEstimator::new(0);
		est.record(100_000, 10_000);
		est.record(499_999, 10_000);
		assert_eq!(est.bytes_per_second(), 0.0, "window has not elapsed yet");

		est.record(500_000, 10_000);
		assert!(est.bytes_per_second() > 0.0);
	}

	#[test]
	fn window_widens_after_fast_start_closes() {
		let mut est = BitrateEstimator::new(0);
		est.record(500_000, 1_000);
		assert_eq!(est.window_us, RUNNING_WINDOW_US);
	}

	#[test]
	fn idle_tick_decays_rate_toward_zero() {
		let mut est = BitrateEstimator::new(0);
		est.record(500_000, 500_000);
		assert!(est.bytes_per_second() > 0.0);

		est.tick(1_500_000);
		assert_eq!(est.bytes_per_second(), 0.0);
	}
}
