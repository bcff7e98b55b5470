/// Connection lifecycle. Transitions are driven by the handshake, by
/// timers (EXP → BROKEN), and by shutdown (Shutdown message or `close`).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ConnState {
	Init,
	Opened,
	Listening,
	Connecting,
	Connected,
	Closing,
	Closed,
	Broken,
	Nonexist,
}

impl ConnState {
	pub fn is_usable(self) -> bool {
		matches!(self, ConnState::Connected | ConnState::Closing)
	}
}

/// Reason a handshake was rejected, carried as a numeric code in the
/// handshake's `req_type` field and retrievable by both sides via
/// `get_rejectreason`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RejectReason {
	Unknown,
	Timeout,
	CookieMismatch,
	Version,
	RoguePeer,
	BadSecret,
	ClosedDuringHandshake,
	BacklogExceeded,
	ApiCollision,
	CongestionControllerCollision,
	FilterCollision,
	GroupCollision,
	PeerVersionTooOld,
}

impl RejectReason {
	pub fn code(self) -> u32 {
		match self {
			RejectReason::Unknown => 0,
			RejectReason::Timeout => 1001,
			RejectReason::CookieMismatch => 1002,
			RejectReason::Version => 1003,
			RejectReason::RoguePeer => 1004,
			RejectReason::BadSecret => 1005,
			RejectReason::ClosedDuringHandshake => 1006,
			RejectReason::BacklogExceeded => 1007,
			RejectReason::ApiCollision => 1008,
			RejectReason::CongestionControllerCollision => 1009,
			RejectReason::FilterCollision => 1010,
			RejectReason::GroupCollision => 1011,
			RejectReason::PeerVersionTooOld => 1012,
		}
	}

	pub fn from_code(code: u32) -> Self {
		match code {
			1001 => RejectReason::Timeout,
			1002 => RejectReason::CookieMismatch,
			1003 => RejectReason::Version,
			1004 => RejectReason::RoguePeer,
			1005 => RejectReason::BadSecret,
			1006 => RejectReason::ClosedDuringHandshake,
			1007 => RejectReason::BacklogExceeded,
			1008 => RejectReason::ApiCollision,
			1009 => RejectReason::CongestionControllerCollision,
			1010 => RejectReason::FilterCollision,
			1011 => RejectReason::GroupCollision,
			1012 => RejectReason::PeerVersionTooOld,
			_ => RejectReason::Unknown,
		}
	}
}

/// The outcome of a KM (key material) exchange, per peer side.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum KmState {
	#[default]
	Unsecured,
	Secured,
	BadSecret,
	NoSecret,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn reject_reason_code_round_trips() {
		for reason in [
			RejectReason::Timeout,
			RejectReason::CookieMismatch,
			RejectReason::Version,
			RejectReason::RoguePeer,
			RejectReason::BadSecret,
			RejectReason::ClosedDuringHandshake,
			RejectReason::BacklogExceeded,
			RejectReason::ApiCollision,
			RejectReason::CongestionControllerCollision,
			RejectReason::FilterCollision,
			RejectReason::GroupCollision,
			RejectReason::PeerVersionTooOld,
		] {
			assert_eq!(RejectReason::from_code(reason.code()), reason);
		}
	}

	#[test]
	fn unknown_code_maps_to_unknown_reason() {
		assert_eq!(RejectReason::from_code(9999), RejectReason::Unknown);
	}

	#[test]
	fn only_connected_and_closing_are_usable() {
		assert!(ConnState::Connected.is_usable());
		assert!(ConnState::Closing.is_usable());
		assert!(!ConnState::Broken.is_usable());
		assert!(!ConnState::Init.is_usable());
	}
}
