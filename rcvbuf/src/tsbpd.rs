//! Maps a peer's 32-bit wire timestamp to a local delivery instant.
//!
//! A data packet carries a timestamp relative to the connection's own
//! epoch, in microseconds, wrapping at `2^32`. `TimeBase` tracks the
//! offset between that epoch and the local steady clock, corrects for
//! the timestamp wrapping mid-connection, and folds in both the
//! configured TSBPD delay and the measured clock drift.

use seqtime::DriftTracker;

/// Width of the wire timestamp field, in microseconds.
const WRAP_PERIOD_US: i64 = 1i64 << 32;
/// How long before the wire timestamp wraps we start watching for it.
const PRE_WRAP_WINDOW_US: u32 = 30_000_000;

pub struct TimeBase {
	base_us: i64,
	wrap_check: bool,
	delay_us: i64,
	drift_us: i64,
	tracker: DriftTracker,
}

impl TimeBase {
	pub fn new(delay_us: i64) -> Self {
		TimeBase { base_us: 0, wrap_check: false, delay_us, drift_us: 0, tracker: DriftTracker::new() }
	}

	/// (Re)initialize the time base, as done once at handshake completion.
	pub fn set(&mut self, base_us: i64, wrap_check: bool, delay_us: i64) {
		self.base_us = base_us;
		self.wrap_check = wrap_check;
		self.delay_us = delay_us;
	}

	/// Adopt a time base handed down by a bonded group's lead member.
	pub fn apply_group_time(&mut self, base_us: i64, wrap_check: bool) {
		self.base_us = base_us;
		self.wrap_check = wrap_check;
	}

	/// Adopt a drift value handed down by a bonded group's lead member,
	/// bypassing the local tracker's own windowing.
	pub fn apply_group_drift(&mut self, drift_us: i64) {
		self.drift_us = drift_us;
	}

	pub fn delay_us(&self) -> i64 {
		self.delay_us
	}

	pub fn drift_us(&self) -> i64 {
		self.drift_us
	}

	pub fn base_us(&self) -> i64 {
		self.base_us
	}

	fn correction_for_wrap(&self, ts: u32) -> i64 {
		if self.wrap_check && ts < PRE_WRAP_WINDOW_US {
			WRAP_PERIOD_US
		} else {
			0
		}
	}

	/// Record one `(ts, arrival_time, rtt)` observation. `rtt_sample` feeds
	/// the caller's RTT estimator elsewhere; only `ts`/`arrival_time` bear
	/// on drift here. Returns the drift and base in effect after the call.
	pub fn add_drift_sample(&mut self, ts: u32, arrival_time_us: u64, _rtt_sample: i64) -> (i64, i64) {
		let corrected_ts = ts as i64 + self.correction_for_wrap(ts);
		let sample = arrival_time_us as i64 - (self.base_us + corrected_ts);

		if let Some(shift) = self.tracker.add_sample(sample) {
			self.base_us += shift;
		}
		self.drift_us = self.tracker.current();

		(self.drift_us, self.base_us)
	}

	/// Arm the wrap-check flag on entering the pre-wrap window, and fold
	/// `2^32` µs into the base once a post-wrap (small) timestamp is seen.
	pub fn update_timebase(&mut self, ts: u32) {
		if !self.wrap_check && ts > u32::MAX - PRE_WRAP_WINDOW_US {
			self.wrap_check = true;
		} else if self.wrap_check && ts < PRE_WRAP_WINDOW_US {
			self.base_us += WRAP_PERIOD_US;
			self.wrap_check = false;
		}
	}

	/// The local instant at which a packet carrying wire timestamp `ts`
	/// should be delivered to the application.
	pub fn play_time(&self, ts: u32) -> i64 {
		self.base_us + self.correction_for_wrap(ts) + ts as i64 + self.delay_us + self.drift_us
	}

	pub fn is_ready(&self, ts: u32, now_us: i64) -> bool {
		now_us >= self.play_time(ts)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn delivers_exactly_at_configured_delay() {
		let mut tb = TimeBase::new(200_000);
		tb.set(1_000_000, false, 200_000);

		assert!(!tb.is_ready(0, 1_000_000 + 199_000));
		assert!(tb.is_ready(0, 1_000_000 + 200_000));
	}

	#[test]
	fn wrap_correction_applies_only_inside_window_with_small_ts() {
		let mut tb = TimeBase::new(0);
		tb.set(0, false, 0);
		tb.update_timebase(u32::MAX - 1_000_000);
		assert!(tb.wrap_check);

		assert_eq!(tb.correction_for_wrap(100), WRAP_PERIOD_US);
		assert_eq!(tb.correction_for_wrap(u32::MAX - 1_000_000), 0);
	}

	#[test]
	fn update_timebase_folds_wrap_into_base_once() {
		let mut tb = TimeBase::new(0);
		tb.set(0, false, 0);
		tb.update_timebase(u32::MAX - 1_000_000);
		tb.update_timebase(1_000_000);

		assert!(!tb.wrap_check);
		assert_eq!(tb.base_us(), WRAP_PERIOD_US);
	}

	#[test]
	fn drift_sample_shifts_base_once_window_closes() {
		let mut tb = TimeBase::new(0);
		tb.set(0, false, 0);

		let mut last = (0, 0);
		for _ in 0..1_000 {
			last = tb.add_drift_sample(0, 20_000, 0);
		}

		assert!(last.0.abs() > 0, "a sustained 20ms offset should register as drift");
	}

	#[test]
	fn apply_group_drift_sets_value_directly() {
		let mut tb = TimeBase::new(0);
		tb.apply_group_drift(1234);
		assert_eq!(tb.drift_us(), 1234);
	}
}
