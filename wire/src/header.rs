use bilge::prelude::*;
use utils::bytes::Cast;
use utils::endian::{b, u32be};

/// Size in bytes of every packet header, data or control.
pub const HEADER_LEN: usize = 16;

/// Packet-boundary tag carried by every data packet, marking its position
/// within its message.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum PacketBoundary {
	/// A middle packet of a multi-packet message.
	#[default]
	Middle,
	/// The first packet of a multi-packet message.
	First,
	/// The last packet of a multi-packet message.
	Last,
	/// The only packet of a single-packet message.
	Solo,
}

impl PacketBoundary {
	fn from_bits(bits: u2) -> Self {
		match u8::from(bits) {
			0b00 => PacketBoundary::Middle,
			0b10 => PacketBoundary::First,
			0b01 => PacketBoundary::Last,
			0b11 => PacketBoundary::Solo,
			_ => unreachable!("u2 only has four values"),
		}
	}

	fn to_bits(self) -> u2 {
		let raw: u8 = match self {
			PacketBoundary::Middle => 0b00,
			PacketBoundary::First => 0b10,
			PacketBoundary::Last => 0b01,
			PacketBoundary::Solo => 0b11,
		};
		u2::new(raw)
	}
}

/// The second 32-bit field of a data packet header: packet boundary,
/// in-order, crypto key, retransmit and message-number flags, packed in
/// wire bit order (most significant field declared last, per `bilge`'s
/// LSB-first field order).
#[bitsize(32)]
#[derive(Clone, Copy, FromBits)]
pub struct DataFlags {
	/// The low 26 bits of the message number this packet belongs to.
	pub msgno: u26,
	/// Set if this packet is a retransmission.
	pub rexmit: bool,
	/// Crypto key flag: 0 = unencrypted, 1 = even key, 2 = odd key.
	pub key: u2,
	/// Set if messages must be delivered to the application in order.
	pub inorder: bool,
	pub pb: u2,
}

/// A decoded data-packet header.
#[derive(Clone, Copy)]
pub struct DataHeader {
	pub seqno: u32,
	pub boundary: PacketBoundary,
	pub inorder: bool,
	pub key: u2,
	pub rexmit: bool,
	pub msgno: u32,
	pub timestamp_us: u32,
	pub dest_socket_id: u32,
}

/// The raw on-wire layout of a data packet header, directly castable onto
/// a 16-byte buffer.
#[derive(Cast)]
#[repr(C)]
struct RawDataHeader {
	/// Top bit always 0; low 31 bits are the sequence number.
	field0: u32be,
	flags: b<DataFlags>,
	timestamp_us: u32be,
	dest_socket_id: u32be,
}

const DATA_MARKER_MASK: u32 = 1 << 31;
const SEQNO_MASK: u32 = DATA_MARKER_MASK - 1;

impl DataHeader {
	pub fn decode(raw: &[u8; HEADER_LEN]) -> Option<Self> {
		let header = utils::bytes::cast::<RawDataHeader, _>(raw);
		let field0 = header.field0.get();

		if field0 & DATA_MARKER_MASK != 0 {
			return None;
		}

		let flags = header.flags.get();

		Some(DataHeader {
			seqno: field0 & SEQNO_MASK,
			boundary: PacketBoundary::from_bits(flags.pb()),
			inorder: flags.inorder(),
			key: flags.key(),
			rexmit: flags.rexmit(),
			msgno: u32::from(flags.msgno()),
			timestamp_us: header.timestamp_us.get(),
			dest_socket_id: header.dest_socket_id.get(),
		})
	}

	pub fn encode(&self, out: &mut [u8; HEADER_LEN]) {
		let flags = DataFlags::new(u26::new(self.msgno & ((1 << 26) - 1)), self.rexmit, self.key, self.inorder, self.boundary.to_bits());

		let header = utils::bytes::cast_mut::<RawDataHeader, _>(out);
		header.field0 = u32be::from(self.seqno & SEQNO_MASK);
		header.flags = b::from(flags);
		header.timestamp_us = u32be::from(self.timestamp_us);
		header.dest_socket_id = u32be::from(self.dest_socket_id);
	}
}

/// Either half of the packet-header union, discriminated by the top bit
/// of the first wire byte.
pub enum Header {
	Data(DataHeader),
	Control(super::control::ControlHeader),
}

impl Header {
	pub fn decode(raw: &[u8; HEADER_LEN]) -> Option<Self> {
		if raw[0] & 0x80 != 0 {
			super::control::ControlHeader::decode(raw).map(Header::Control)
		} else {
			DataHeader::decode(raw).map(Header::Data)
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample(boundary: PacketBoundary) -> DataHeader {
		DataHeader {
			seqno: 0x3FFF_FFFF,
			boundary,
			inorder: true,
			key: u2::new(1),
			rexmit: false,
			msgno: 0x0123_4567,
			timestamp_us: 0xCAFEBABE,
			dest_socket_id: 7,
		}
	}

	#[test]
	fn solo_round_trips() {
		let header = sample(PacketBoundary::Solo);
		let mut buf = [0u8; HEADER_LEN];
		header.encode(&mut buf);

		assert_eq!(buf[0] & 0x80, 0, "data marker bit must be clear");

		let decoded = DataHeader::decode(&buf).expect("valid data header");
		assert_eq!(decoded.seqno, header.seqno);
		assert_eq!(decoded.boundary, PacketBoundary::Solo);
		assert!(decoded.inorder);
		assert_eq!(u8::from(decoded.key), 1);
		assert!(!decoded.rexmit);
		assert_eq!(decoded.msgno, header.msgno & ((1 << 26) - 1));
		assert_eq!(decoded.timestamp_us, header.timestamp_us);
		assert_eq!(decoded.dest_socket_id, header.dest_socket_id);
	}

	#[test]
	fn every_boundary_round_trips() {
		for boundary in [PacketBoundary::First, PacketBoundary::Middle, PacketBoundary::Last, PacketBoundary::Solo] {
			let header = sample(boundary);
			let mut buf = [0u8; HEADER_LEN];
			header.encode(&mut buf);
			assert_eq!(DataHeader::decode(&buf).unwrap().boundary, boundary);
		}
	}

	#[test]
	fn control_marker_bit_rejects_data_decode() {
		let mut buf = [0u8; HEADER_LEN];
		buf[0] = 0x80;
		assert!(DataHeader::decode(&buf).is_none());
	}
}
