use macros::Cast;
use utils::bytes::Cast as _;
use utils::endian::u32be;

use crate::header::HEADER_LEN;

/// Control-packet message type, carried in bits `[1..15]` of the first
/// header word.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ControlType {
	Handshake,
	Keepalive,
	Ack,
	Nak,
	CongestionWarning,
	Shutdown,
	AckAck,
	DropRequest,
	PeerError,
	/// A user-defined extension type, carrying the raw 15-bit code.
	Ext(u16),
}

impl ControlType {
	fn from_code(code: u16) -> Self {
		match code {
			0 => ControlType::Handshake,
			1 => ControlType::Keepalive,
			2 => ControlType::Ack,
			3 => ControlType::Nak,
			4 => ControlType::CongestionWarning,
			5 => ControlType::Shutdown,
			6 => ControlType::AckAck,
			7 => ControlType::DropRequest,
			8 => ControlType::PeerError,
			other => ControlType::Ext(other),
		}
	}

	fn code(self) -> u16 {
		match self {
			ControlType::Handshake => 0,
			ControlType::Keepalive => 1,
			ControlType::Ack => 2,
			ControlType::Nak => 3,
			ControlType::CongestionWarning => 4,
			ControlType::Shutdown => 5,
			ControlType::AckAck => 6,
			ControlType::DropRequest => 7,
			ControlType::PeerError => 8,
			ControlType::Ext(code) => code,
		}
	}
}

/// Type-specific body carried in the second header word, interpreted
/// according to [`ControlType`].
#[derive(Clone, Copy, Debug)]
pub enum ControlBody {
	/// ACK: the ACK sequence number used to match a later ACKACK.
	Ack { ack_seq: u32 },
	/// ACKACK: echoes the ACK sequence number it is acknowledging.
	AckAck { ack_seq: u32 },
	/// Message Drop Request: the message number being dropped.
	DropRequest { msgno: u32 },
	/// PeerError: an implementation-defined error code.
	PeerError { code: u32 },
	/// Any other control type: the raw 32-bit type-specific field,
	/// uninterpreted (loss lists and handshake bodies follow the header
	/// as variable-length payload instead).
	Raw(u32),
}

impl ControlBody {
	fn decode(ty: ControlType, raw: u32) -> Self {
		match ty {
			ControlType::Ack => ControlBody::Ack { ack_seq: raw },
			ControlType::AckAck => ControlBody::AckAck { ack_seq: raw },
			ControlType::DropRequest => ControlBody::DropRequest { msgno: raw },
			ControlType::PeerError => ControlBody::PeerError { code: raw },
			_ => ControlBody::Raw(raw),
		}
	}

	fn encode(self) -> u32 {
		match self {
			ControlBody::Ack { ack_seq } => ack_seq,
			ControlBody::AckAck { ack_seq } => ack_seq,
			ControlBody::DropRequest { msgno } => msgno,
			ControlBody::PeerError { code } => code,
			ControlBody::Raw(raw) => raw,
		}
	}
}

/// A decoded control-packet header. The control body that follows (loss
/// list, handshake fields, ...) is decoded separately by `transport`,
/// keyed on `ty`.
#[derive(Clone, Copy)]
pub struct ControlHeader {
	pub ty: ControlType,
	pub subtype: u16,
	pub body: ControlBody,
	pub timestamp_us: u32,
	pub dest_socket_id: u32,
}

#[derive(Cast)]
#[repr(C)]
struct RawControlHeader {
	field0: u32be,
	field1: u32be,
	timestamp_us: u32be,
	dest_socket_id: u32be,
}

const CONTROL_MARKER_MASK: u32 = 1 << 31;
const TYPE_MASK: u32 = 0x7FFF;
const TYPE_SHIFT: u32 = 16;
const SUBTYPE_MASK: u32 = 0xFFFF;

impl ControlHeader {
	pub fn decode(raw: &[u8; HEADER_LEN]) -> Option<Self> {
		let header = utils::bytes::cast::<RawControlHeader, _>(raw);
		let field0 = header.field0.get();

		if field0 & CONTROL_MARKER_MASK == 0 {
			return None;
		}

		let ty = ControlType::from_code(((field0 >> TYPE_SHIFT) & TYPE_MASK) as u16);
		let subtype = (field0 & SUBTYPE_MASK) as u16;
		let body = ControlBody::decode(ty, header.field1.get());

		Some(ControlHeader { ty, subtype, body, timestamp_us: header.timestamp_us.get(), dest_socket_id: header.dest_socket_id.get() })
	}

	pub fn encode(&self, out: &mut [u8; HEADER_LEN]) {
		let field0 = CONTROL_MARKER_MASK | ((self.ty.code() as u32) << TYPE_SHIFT) | (self.subtype as u32 & SUBTYPE_MASK);

		let header = utils::bytes::cast_mut::<RawControlHeader, _>(out);
		header.field0 = u32be::from(field0);
		header.field1 = u32be::from(self.body.encode());
		header.timestamp_us = u32be::from(self.timestamp_us);
		header.dest_socket_id = u32be::from(self.dest_socket_id);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ack_round_trips() {
		let header = ControlHeader {
			ty: ControlType::Ack,
			subtype: 0,
			body: ControlBody::Ack { ack_seq: 42 },
			timestamp_us: 123_456,
			dest_socket_id: 0xDEAD_BEEF,
		};

		let mut buf = [0u8; HEADER_LEN];
		header.encode(&mut buf);

		assert_eq!(buf[0] & 0x80, 0x80, "control marker bit must be set");

		let decoded = ControlHeader::decode(&buf).expect("valid control header");
		assert_eq!(decoded.ty, ControlType::Ack);
		assert_eq!(decoded.timestamp_us, 123_456);
		assert_eq!(decoded.dest_socket_id, 0xDEAD_BEEF);
		assert!(matches!(decoded.body, ControlBody::Ack { ack_seq: 42 }));
	}

	#[test]
	fn ext_type_preserves_raw_code() {
		let header = ControlHeader {
			ty: ControlType::Ext(0x1234),
			subtype: 7,
			body: ControlBody::Raw(99),
			timestamp_us: 0,
			dest_socket_id: 1,
		};

		let mut buf = [0u8; HEADER_LEN];
		header.encode(&mut buf);
		let decoded = ControlHeader::decode(&buf).unwrap();
		assert_eq!(decoded.ty, ControlType::Ext(0x1234));
		assert_eq!(decoded.subtype, 7);
	}

	#[test]
	fn data_marker_bit_rejects_control_decode() {
		let buf = [0u8; HEADER_LEN];
		assert!(ControlHeader::decode(&buf).is_none());
	}
}
