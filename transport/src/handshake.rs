//! Five-way handshake message format and the small amount of pure logic
//! (cookie contest, induction/conclusion framing) around it. The fixed
//! core is zero-copy cast like every other wire struct; the trailing
//! extension blocks are a simple type/length/value list, since they are
//! genuinely variable-length and don't fit the fixed-`repr(C)` pattern.

use utils::bytes::Cast;
use utils::endian::u32be;

pub const CORE_LEN: usize = 48;

/// Handshake request type, carried in the core's `req_type` field.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HandshakeType {
	/// Rendezvous-mode initial exchange.
	Waveahand,
	Induction,
	Conclusion,
	/// A rejection, carrying the reason as a negative code on the wire.
	Rejection(u32),
}

impl HandshakeType {
	fn from_code(code: u32) -> Self {
		match code as i32 {
			0 => HandshakeType::Waveahand,
			1 => HandshakeType::Induction,
			-1 => HandshakeType::Conclusion,
			n if n < 0 => HandshakeType::Rejection((-n) as u32),
			_ => HandshakeType::Rejection(0),
		}
	}

	fn to_code(self) -> u32 {
		(match self {
			HandshakeType::Waveahand => 0,
			HandshakeType::Induction => 1,
			HandshakeType::Conclusion => -1,
			HandshakeType::Rejection(reason) => -(reason as i32),
		}) as u32
	}
}

#[derive(Cast)]
#[repr(C)]
struct RawCore {
	version: u32be,
	enc_field: u32be,
	ext_field: u32be,
	initial_seq: u32be,
	mss: u32be,
	flow_window_size: u32be,
	req_type: u32be,
	socket_id: u32be,
	syn_cookie: u32be,
	peer_ip: [u32be; 4],
}

/// The handshake's fixed 48-byte core.
#[derive(Clone, Copy, Debug)]
pub struct Core {
	pub version: u32,
	pub enc_field: u32,
	pub ext_field: u32,
	pub initial_seq: u32,
	pub mss: u32,
	pub flow_window_size: u32,
	pub req_type: HandshakeType,
	pub socket_id: u32,
	pub syn_cookie: u32,
	pub peer_ip: [u32; 4],
}

impl Core {
	pub fn decode(raw: &[u8; CORE_LEN]) -> Self {
		let r = utils::bytes::cast::<RawCore, _>(raw);
		Core {
			version: r.version.get(),
			enc_field: r.enc_field.get(),
			ext_field: r.ext_field.get(),
			initial_seq: r.initial_seq.get(),
			mss: r.mss.get(),
			flow_window_size: r.flow_window_size.get(),
			req_type: HandshakeType::from_code(r.req_type.get()),
			socket_id: r.socket_id.get(),
			syn_cookie: r.syn_cookie.get(),
			peer_ip: [r.peer_ip[0].get(), r.peer_ip[1].get(), r.peer_ip[2].get(), r.peer_ip[3].get()],
		}
	}

	pub fn encode(&self, out: &mut [u8; CORE_LEN]) {
		let r = utils::bytes::cast_mut::<RawCore, _>(out);
		r.version = u32be::from(self.version);
		r.enc_field = u32be::from(self.enc_field);
		r.ext_field = u32be::from(self.ext_field);
		r.initial_seq = u32be::from(self.initial_seq);
		r.mss = u32be::from(self.mss);
		r.flow_window_size = u32be::from(self.flow_window_size);
		r.req_type = u32be::from(self.req_type.to_code());
		r.socket_id = u32be::from(self.socket_id);
		r.syn_cookie = u32be::from(self.syn_cookie);
		r.peer_ip = [u32be::from(self.peer_ip[0]), u32be::from(self.peer_ip[1]), u32be::from(self.peer_ip[2]), u32be::from(self.peer_ip[3])];
	}
}

const EXT_TYPE_HSREQ: u16 = 1;
const EXT_TYPE_KMREQ: u16 = 2;
const EXT_TYPE_SID: u16 = 3;

/// A trailing handshake extension block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Extension {
	/// Peer's protocol version, flag set, and requested TSBPD latency.
	HsReq { version: u32, flags: u32, latency_ms: u16 },
	/// An opaque key-material block; actual crypto is out of scope here.
	Km(Vec<u8>),
	/// Stream id, an application-chosen routing string.
	Sid(String),
}

/// Append `ext`'s TLV encoding (`type:u16`, `len:u16`, payload) to `out`.
pub fn encode_extension(ext: &Extension, out: &mut Vec<u8>) {
	let (ty, payload): (u16, Vec<u8>) = match ext {
		Extension::HsReq { version, flags, latency_ms } => {
			let mut p = Vec::with_capacity(10);
			p.extend_from_slice(&version.to_be_bytes());
			p.extend_from_slice(&flags.to_be_bytes());
			p.extend_from_slice(&latency_ms.to_be_bytes());
			(EXT_TYPE_HSREQ, p)
		}
		Extension::Km(bytes) => (EXT_TYPE_KMREQ, bytes.clone()),
		Extension::Sid(s) => (EXT_TYPE_SID, s.as_bytes().to_vec()),
	};

	out.extend_from_slice(&ty.to_be_bytes());
	out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
	out.extend_from_slice(&payload);
}

/// Parse every TLV extension out of a trailing byte slice. Malformed or
/// truncated trailing bytes stop parsing and return what was decoded so far.
pub fn decode_extensions(mut buf: &[u8]) -> Vec<Extension> {
	let mut out = Vec::new();

	while buf.len() >= 4 {
		let ty = u16::from_be_bytes([buf[0], buf[1]]);
		let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;

		if buf.len() < 4 + len {
			break;
		}
		let payload = &buf[4..4 + len];

		let ext = match ty {
			EXT_TYPE_HSREQ if len >= 10 => Some(Extension::HsReq {
				version: u32::from_be_bytes(payload[0..4].try_into().unwrap()),
				flags: u32::from_be_bytes(payload[4..8].try_into().unwrap()),
				latency_ms: u16::from_be_bytes(payload[8..10].try_into().unwrap()),
			}),
			EXT_TYPE_KMREQ => Some(Extension::Km(payload.to_vec())),
			EXT_TYPE_SID => String::from_utf8(payload.to_vec()).ok().map(Extension::Sid),
			_ => None,
		};

		if let Some(ext) = ext {
			out.push(ext);
		}

		buf = &buf[4 + len..];
	}

	out
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample_core() -> Core {
		Core {
			version: 5,
			enc_field: 2,
			ext_field: 0xBEEF,
			initial_seq: 0x1234_5678,
			mss: 1500,
			flow_window_size: 8192,
			req_type: HandshakeType::Conclusion,
			socket_id: 42,
			syn_cookie: 0xCAFE_BABE,
			peer_ip: [1, 2, 3, 4],
		}
	}

	#[test]
	fn core_round_trips() {
		let core = sample_core();
		let mut buf = [0u8; CORE_LEN];
		core.encode(&mut buf);
		let decoded = Core::decode(&buf);

		assert_eq!(decoded.version, core.version);
		assert_eq!(decoded.req_type, HandshakeType::Conclusion);
		assert_eq!(decoded.syn_cookie, core.syn_cookie);
		assert_eq!(decoded.peer_ip, core.peer_ip);
	}

	#[test]
	fn rejection_code_round_trips() {
		let mut core = sample_core();
		core.req_type = HandshakeType::Rejection(1002);

		let mut buf = [0u8; CORE_LEN];
		core.encode(&mut buf);
		assert_eq!(Core::decode(&buf).req_type, HandshakeType::Rejection(1002));
	}

	#[test]
	fn extensions_round_trip() {
		let exts = vec![Extension::HsReq { version: 5, flags: 0xF0, latency_ms: 200 }, Extension::Sid("channel-1".into())];

		let mut buf = Vec::new();
		for ext in &exts {
			encode_extension(ext, &mut buf);
		}

		assert_eq!(decode_extensions(&buf), exts);
	}
}
