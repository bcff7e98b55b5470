use crate::rtt::RttEstimator;
use crate::state::{ConnState, KmState, RejectReason};
use crate::timers::{ExpTimer, KeepaliveTimer};

/// Whether the local side initiated the connection, accepted it, or is
/// one half of a rendezvous pair.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Role {
	Caller,
	Listener,
	Rendezvous,
}

/// One full ACK report, per §4.I: past-the-end sequence, RTT/RTTVar,
/// available buffer space, and the receive/send rate fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AckReport {
	pub ack_seq: u32,
	pub rtt_us: i64,
	pub rttvar_us: i64,
	pub available_buffer: u32,
	pub receive_rate_bps: u64,
	pub bandwidth_bps: u64,
}

/// Whether enforced encryption on either side forbids completing the
/// handshake, given the KM exchange's outcome.
pub fn resolve_km(local_enforced: bool, peer_enforced: bool, km_state: KmState) -> Result<KmState, RejectReason> {
	let enforced = local_enforced || peer_enforced;

	if enforced && km_state != KmState::Secured {
		return Err(RejectReason::BadSecret);
	}

	Ok(km_state)
}

/// Drives a single connection's timers and ACK cadence. Owns no buffers
/// directly — `sndbuf`/`rcvbuf` are held by the caller (the multiplexer)
/// and referenced by the connection's `(seq, kind)` tasks in the
/// scheduler — so this stays focused on state and timing.
pub struct Connection {
	pub role: Role,
	pub state: ConnState,
	pub rtt: RttEstimator,
	pub exp: ExpTimer,
	pub keepalive: KeepaliveTimer,
	pub km_state: KmState,
	last_full_ack_seq: Option<u32>,
	last_ack_send_us: i64,
	reject_reason: Option<RejectReason>,
}

const FULL_ACK_PERIOD_US: i64 = 10_000;

impl Connection {
	pub fn new(role: Role, now_us: i64, conn_timeout_us: i64) -> Self {
		let rtt = RttEstimator::new();
		Connection {
			role,
			state: ConnState::Init,
			exp: ExpTimer::new(&rtt, conn_timeout_us),
			rtt,
			keepalive: KeepaliveTimer::new(now_us),
			km_state: KmState::Unsecured,
			last_full_ack_seq: None,
			last_ack_send_us: now_us,
			reject_reason: None,
		}
	}

	pub fn mark_connected(&mut self) {
		self.state = ConnState::Connected;
	}

	pub fn reject(&mut self, reason: RejectReason) {
		self.reject_reason = Some(reason);
		self.state = ConnState::Broken;
	}

	pub fn get_rejectreason(&self) -> Option<RejectReason> {
		self.reject_reason
	}

	/// Record one RTT sample (from an ACKACK) and reset the EXP timer,
	/// since this counts as traffic.
	pub fn on_rtt_sample(&mut self, r_us: i64) {
		self.rtt.sample(r_us);
		self.exp.reset(&self.rtt);
	}

	/// Called every time the 10ms ACK tick fires. Returns `None` if the
	/// past-the-end sequence hasn't advanced since the last ACK (the ACK
	/// is suppressed).
	pub fn maybe_full_ack(&mut self, now_us: i64, ack_seq: u32, available_buffer: u32, receive_rate_bps: u64, bandwidth_bps: u64) -> Option<AckReport> {
		if now_us - self.last_ack_send_us < FULL_ACK_PERIOD_US {
			return None;
		}
		self.last_ack_send_us = now_us;

		if self.last_full_ack_seq == Some(ack_seq) {
			return None;
		}
		self.last_full_ack_seq = Some(ack_seq);

		Some(AckReport { ack_seq, rtt_us: self.rtt.rtt_us(), rttvar_us: self.rtt.rttvar_us(), available_buffer, receive_rate_bps, bandwidth_bps })
	}

	/// Transition through CLOSING to CLOSED once a Shutdown has been
	/// processed and every pending read has drained.
	pub fn close(&mut self) {
		if self.state == ConnState::Broken {
			return;
		}
		self.state = ConnState::Closing;
	}

	pub fn finish_close(&mut self) {
		if self.state == ConnState::Closing {
			self.state = ConnState::Closed;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn enforced_encryption_mismatch_rejects_with_bad_secret() {
		let outcome = resolve_km(true, true, KmState::Unsecured);
		assert_eq!(outcome, Err(RejectReason::BadSecret));
	}

	#[test]
	fn enforced_encryption_with_matching_secret_succeeds() {
		let outcome = resolve_km(true, true, KmState::Secured);
		assert_eq!(outcome, Ok(KmState::Secured));
	}

	#[test]
	fn unenforced_mismatch_is_accepted_but_reports_unsecured() {
		let outcome = resolve_km(false, false, KmState::BadSecret);
		assert_eq!(outcome, Ok(KmState::BadSecret));
	}

	#[test]
	fn full_ack_suppressed_when_seq_has_not_advanced() {
		let mut conn = Connection::new(Role::Listener, 0, 30_000_000);
		assert!(conn.maybe_full_ack(10_000, 5, 100, 0, 0).is_some());
		assert!(conn.maybe_full_ack(20_000, 5, 100, 0, 0).is_none(), "unchanged ack seq should suppress");
		assert!(conn.maybe_full_ack(30_000, 6, 100, 0, 0).is_some(), "advanced ack seq should report again");
	}

	#[test]
	fn full_ack_respects_the_10ms_cadence() {
		let mut conn = Connection::new(Role::Listener, 0, 30_000_000);
		assert!(conn.maybe_full_ack(5_000, 1, 0, 0, 0).is_none(), "too soon since connection start");
	}

	#[test]
	fn close_then_finish_close_reaches_closed() {
		let mut conn = Connection::new(Role::Caller, 0, 30_000_000);
		conn.mark_connected();
		conn.close();
		assert_eq!(conn.state, ConnState::Closing);
		conn.finish_close();
		assert_eq!(conn.state, ConnState::Closed);
	}

	#[test]
	fn rtt_sample_resets_exp_timer_interval() {
		let mut conn = Connection::new(Role::Caller, 0, 30_000_000);
		conn.exp.on_expiry();
		let doubled = conn.exp.interval_us();
		conn.on_rtt_sample(50_000);
		assert!(conn.exp.interval_us() < doubled);
	}
}
