/// RFC 3550-style jitter estimator: tracks how much a measured delay
/// varies sample to sample, as a 16-sample IIR average of the absolute
/// change in delay (`J += (|D| - J) / 16`).
///
/// A single tracker only needs the delay relative to *some* fixed
/// reference per sample; three independent instances below cover
/// arrival jitter (packet's nominal play time vs. actual arrival),
/// delivery jitter (target play time vs. actual delivery to the
/// application), and sending jitter (origin time vs. actual wire send).
const IIR_SHIFT: u64 = 4; // divide by 16

#[derive(Default)]
pub struct JitterEstimator {
	prev_delay_us: Option<i64>,
	jitter_us: u64,
}

impl JitterEstimator {
	pub fn new() -> Self {
		JitterEstimator::default()
	}

	/// Feed one `delay_us` sample (actual instant minus predicted instant,
	/// signed, in microseconds) and return the updated jitter estimate.
	pub fn sample(&mut self, delay_us: i64) -> u64 {
		if let Some(prev) = self.prev_delay_us {
			let di = (delay_us - prev).unsigned_abs();
			self.jitter_us += (di.saturating_sub(self.jitter_us)) >> IIR_SHIFT;
		}
		self.prev_delay_us = Some(delay_us);
		self.jitter_us
	}

	pub fn jitter_us(&self) -> u64 {
		self.jitter_us
	}
}

/// Bundles the three jitter measurements a connection can report:
/// packet arrival (network jitter), application delivery (post-TSBPD),
/// and send-side scheduling jitter.
#[derive(Default)]
pub struct JitterTracer {
	arrival: JitterEstimator,
	delivery: JitterEstimator,
	send: JitterEstimator,
}

impl JitterTracer {
	pub fn new() -> Self {
		JitterTracer::default()
	}

	/// A data packet carrying `timestamp_us` (relative to `tsbpd_base_us`)
	/// arrived at `arrival_us`; both are on the same steady clock.
	pub fn on_data_pkt_arrival(&mut self, timestamp_us: u32, tsbpd_base_us: i64, arrival_us: i64) {
		let predicted = tsbpd_base_us + timestamp_us as i64;
		self.arrival.sample(arrival_us - predicted);
	}

	/// A packet targeted for delivery at `target_us` was actually handed
	/// to the application at `delivered_us`.
	pub fn on_data_pkt_delivery(&mut self, target_us: i64, delivered_us: i64) {
		self.delivery.sample(delivered_us - target_us);
	}

	/// A packet originated (enqueued by the application) at `origin_us`
	/// was actually placed on the wire at `sent_us`.
	pub fn on_data_pkt_sent(&mut self, origin_us: i64, sent_us: i64) {
		self.send.sample(sent_us - origin_us);
	}

	pub fn jitter_us(&self) -> u64 {
		self.arrival.jitter_us()
	}

	pub fn delivery_jitter_us(&self) -> u64 {
		self.delivery.jitter_us()
	}

	pub fn sending_jitter_us(&self) -> u64 {
		self.send.jitter_us()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn constant_delay_keeps_jitter_at_zero() {
		let mut j = JitterEstimator::new();
		for _ in 0..10 {
			j.sample(5_000);
		}
		assert_eq!(j.jitter_us(), 0);
	}

	#[test]
	fn varying_delay_drives_jitter_up() {
		let mut j = JitterEstimator::new();
		let mut last = 0;
		for i in 0..50 {
			let delay = if i % 2 == 0 { 1_000 } else { 9_000 };
			last = j.sample(delay);
		}
		assert!(last > 0);
	}

	#[test]
	fn first_sample_never_moves_jitter() {
		let mut j = JitterEstimator::new();
		assert_eq!(j.sample(100_000), 0);
	}

	#[test]
	fn tracer_keeps_the_three_measures_independent() {
		let mut t = JitterTracer::new();
		t.on_data_pkt_arrival(1_000, 0, 1_100);
		t.on_data_pkt_arrival(2_000, 0, 2_300);
		t.on_data_pkt_delivery(5_000, 5_000);
		t.on_data_pkt_delivery(6_000, 6_000);

		assert!(t.jitter_us() > 0);
		assert_eq!(t.delivery_jitter_us(), 0);
		assert_eq!(t.sending_jitter_us(), 0);
	}
}
