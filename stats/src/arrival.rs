use std::collections::VecDeque;

/// Packet-arrival rate on the receive side, estimated by median-filtering
/// the last `WINDOW` inter-arrival intervals. A median is far less
/// sensitive to a single reordered or bursty arrival than a mean would be.
const WINDOW: usize = 16;

pub struct ArrivalRateFilter {
	intervals_us: VecDeque<u64>,
	last_arrival_us: Option<u64>,
}

impl ArrivalRateFilter {
	pub fn new() -> Self {
		ArrivalRateFilter { intervals_us: VecDeque::with_capacity(WINDOW), last_arrival_us: None }
	}

	pub fn record_arrival(&mut self, now_us: u64) {
		if let Some(last) = self.last_arrival_us {
			if self.intervals_us.len() == WINDOW {
				self.intervals_us.pop_front();
			}
			self.intervals_us.push_back(now_us.saturating_sub(last));
		}
		self.last_arrival_us = Some(now_us);
	}

	fn median_interval_us(&self) -> Option<u64> {
		if self.intervals_us.is_empty() {
			return None;
		}

		let mut sorted: Vec<u64> = self.intervals_us.iter().copied().collect();
		sorted.sort_unstable();
		Some(sorted[sorted.len() / 2])
	}

	pub fn packets_per_second(&self) -> f64 {
		match self.median_interval_us() {
			Some(0) | None => 0.0,
			Some(median) => 1_000_000.0 / median as f64,
		}
	}
}

impl Default for ArrivalRateFilter {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn no_samples_reports_zero_rate() {
		let filter = ArrivalRateFilter::new();
		assert_eq!(filter.packets_per_second(), 0.0);
	}

	#[test]
	fn constant_interval_reports_matching_rate() {
		let mut filter = ArrivalRateFilter::new();
		for i in 0..20u64 {
			filter.record_arrival(i * 1_000);
		}
		assert_eq!(filter.packets_per_second(), 1_000.0);
	}

	#[test]
	fn median_is_robust_to_one_outlier_burst() {
		let mut filter = ArrivalRateFilter::new();
		let mut t = 0u64;
		for _ in 0..15 {
			t += 1_000;
			filter.record_arrival(t);
		}
		t += 50_000;
		filter.record_arrival(t);

		assert_eq!(filter.packets_per_second(), 1_000.0, "one burst shouldn't move the median");
	}

	#[test]
	fn window_keeps_only_last_16_intervals() {
		let mut filter = ArrivalRateFilter::new();
		let mut t = 0u64;
		for _ in 0..100 {
			t += 1_000;
			filter.record_arrival(t);
		}
		assert_eq!(filter.intervals_us.len(), WINDOW);
	}
}
