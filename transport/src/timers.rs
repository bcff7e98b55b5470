use crate::rtt::RttEstimator;

/// Send keepalive after this much silence on the send side.
pub const KEEPALIVE_SILENCE_US: i64 = 1_000_000;
/// Cap on the doubling EXP interval.
const EXP_MAX_US: i64 = 10_000_000;
/// Default total-silence timeout before the connection is declared broken.
pub const DEFAULT_CONN_TIMEOUT_US: i64 = 30_000_000;

/// The connection-expiry timer: starts at `1s + 4*RTT + RTTVar`, doubles
/// on every expiry up to 10s, and tracks total elapsed silence against
/// the configured connection timeout.
pub struct ExpTimer {
	interval_us: i64,
	conn_timeout_us: i64,
	silence_us: i64,
}

impl ExpTimer {
	pub fn new(rtt: &RttEstimator, conn_timeout_us: i64) -> Self {
		ExpTimer { interval_us: rtt.exp_base_us(), conn_timeout_us, silence_us: 0 }
	}

	pub fn interval_us(&self) -> i64 {
		self.interval_us
	}

	/// Called when the timer fires with no traffic seen. Returns `true`
	/// once accumulated silence exceeds the connection timeout — the
	/// connection should move to BROKEN.
	pub fn on_expiry(&mut self) -> bool {
		self.silence_us += self.interval_us;
		self.interval_us = (self.interval_us * 2).min(EXP_MAX_US);
		self.silence_us >= self.conn_timeout_us
	}

	/// Any inbound or outbound traffic resets the silence clock and
	/// re-arms the interval from the current RTT estimate.
	pub fn reset(&mut self, rtt: &RttEstimator) {
		self.silence_us = 0;
		self.interval_us = rtt.exp_base_us();
	}
}

/// Fires a KEEPALIVE after `KEEPALIVE_SILENCE_US` of send-side silence.
pub struct KeepaliveTimer {
	last_send_us: i64,
}

impl KeepaliveTimer {
	pub fn new(now_us: i64) -> Self {
		KeepaliveTimer { last_send_us: now_us }
	}

	pub fn on_send(&mut self, now_us: i64) {
		self.last_send_us = now_us;
	}

	pub fn due(&self, now_us: i64) -> bool {
		now_us - self.last_send_us >= KEEPALIVE_SILENCE_US
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn exp_timer_doubles_and_caps() {
		let rtt = RttEstimator::new();
		let mut exp = ExpTimer::new(&rtt, DEFAULT_CONN_TIMEOUT_US);
		let base = exp.interval_us();

		exp.on_expiry();
		assert_eq!(exp.interval_us(), base * 2);

		for _ in 0..10 {
			exp.on_expiry();
		}
		assert_eq!(exp.interval_us(), EXP_MAX_US);
	}

	#[test]
	fn exp_timer_declares_broken_after_total_timeout() {
		let rtt = RttEstimator::new();
		let mut exp = ExpTimer::new(&rtt, 5_000_000);

		let mut broken = false;
		for _ in 0..20 {
			broken = exp.on_expiry();
			if broken {
				break;
			}
		}
		assert!(broken);
	}

	#[test]
	fn keepalive_due_after_one_second_of_silence() {
		let mut ka = KeepaliveTimer::new(0);
		assert!(!ka.due(500_000));
		assert!(ka.due(1_000_000));
		ka.on_send(1_000_000);
		assert!(!ka.due(1_500_000));
	}
}
