//! The option table of §6, as typed fields rather than stringly-typed
//! key/value pairs, since the set of recognized options is closed.

use crate::error::{ApiError, Error, Result};

/// Identifies one option for `set_option`/`get_option` dispatch.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OptionName {
	Mss,
	SndBuf,
	RcvBuf,
	Fc,
	Latency,
	TsbpdMode,
	TlPktDrop,
	NakReport,
	ConnTimeo,
	Passphrase,
	PbKeyLen,
	EnforcedEncryption,
	MessageApi,
	PayloadSize,
	SndSyn,
	RcvSyn,
	SndTimeo,
	RcvTimeo,
	LossMaxTtl,
	KmState,
	SndKmState,
	RcvKmState,
	StreamId,
}

#[derive(Clone, Debug, PartialEq)]
pub enum OptionValue {
	Int(i64),
	Bool(bool),
	Text(String),
}

impl OptionValue {
	fn as_i64(&self) -> Result<i64> {
		match self {
			OptionValue::Int(v) => Ok(*v),
			_ => Err(ApiError::InvalidParameter.into()),
		}
	}

	fn as_bool(&self) -> Result<bool> {
		match self {
			OptionValue::Bool(v) => Ok(*v),
			_ => Err(ApiError::InvalidParameter.into()),
		}
	}

	fn as_text(&self) -> Result<String> {
		match self {
			OptionValue::Text(v) => Ok(v.clone()),
			_ => Err(ApiError::InvalidParameter.into()),
		}
	}
}

/// Options fixed once the socket connects or accepts; setting one after
/// that point is an API error.
#[derive(Clone, Debug)]
pub struct PreOptions {
	pub mss: u32,
	pub fc: u32,
	pub latency_ms: u32,
	pub tsbpd_mode: bool,
	pub passphrase: Option<String>,
	pub pbkeylen: u32,
	pub enforced_encryption: bool,
	pub message_api: bool,
	pub payload_size: u32,
	pub stream_id: String,
}

impl Default for PreOptions {
	fn default() -> Self {
		PreOptions {
			mss: 1500,
			fc: 25_600,
			latency_ms: 120,
			tsbpd_mode: true,
			passphrase: None,
			pbkeylen: 0,
			enforced_encryption: true,
			message_api: false,
			payload_size: 1316,
			stream_id: String::new(),
		}
	}
}

/// Options that may be changed at any point in the socket's life.
#[derive(Clone, Debug)]
pub struct PostOptions {
	pub sndbuf: u32,
	pub rcvbuf: u32,
	pub tlpktdrop: bool,
	pub nakreport: bool,
	pub conn_timeo_ms: u32,
	pub snd_syn: bool,
	pub rcv_syn: bool,
	pub snd_timeo_ms: Option<u32>,
	pub rcv_timeo_ms: Option<u32>,
	pub lossmaxttl: u32,
}

impl Default for PostOptions {
	fn default() -> Self {
		PostOptions {
			sndbuf: 8_192_000,
			rcvbuf: 8_192_000,
			tlpktdrop: true,
			nakreport: true,
			conn_timeo_ms: 30_000,
			snd_syn: true,
			rcv_syn: true,
			snd_timeo_ms: None,
			rcv_timeo_ms: None,
			lossmaxttl: 0,
		}
	}
}

#[derive(Clone, Debug, Default)]
pub struct Options {
	pub pre: PreOptions,
	pub post: PostOptions,
	/// Set once the socket has connected or accepted; locks `pre`.
	pub locked: bool,
}

impl Options {
	pub fn set(&mut self, name: OptionName, value: OptionValue) -> Result<()> {
		if self.locked && is_pre_option(name) {
			return Err(ApiError::OptionLockedPostConnect.into());
		}

		match name {
			OptionName::Mss => self.pre.mss = value.as_i64()? as u32,
			OptionName::Fc => self.pre.fc = value.as_i64()? as u32,
			OptionName::Latency => self.pre.latency_ms = value.as_i64()? as u32,
			OptionName::TsbpdMode => self.pre.tsbpd_mode = value.as_bool()?,
			OptionName::Passphrase => self.pre.passphrase = Some(value.as_text()?),
			OptionName::PbKeyLen => {
				let n = value.as_i64()?;
				if ![0, 16, 24, 32].contains(&n) {
					return Err(ApiError::InvalidParameter.into());
				}
				self.pre.pbkeylen = n as u32;
			}
			OptionName::EnforcedEncryption => self.pre.enforced_encryption = value.as_bool()?,
			OptionName::MessageApi => self.pre.message_api = value.as_bool()?,
			OptionName::PayloadSize => self.pre.payload_size = value.as_i64()? as u32,
			OptionName::StreamId => self.pre.stream_id = value.as_text()?,
			OptionName::SndBuf => self.post.sndbuf = value.as_i64()? as u32,
			OptionName::RcvBuf => self.post.rcvbuf = value.as_i64()? as u32,
			OptionName::TlPktDrop => self.post.tlpktdrop = value.as_bool()?,
			OptionName::NakReport => self.post.nakreport = value.as_bool()?,
			OptionName::ConnTimeo => self.post.conn_timeo_ms = value.as_i64()? as u32,
			OptionName::SndSyn => self.post.snd_syn = value.as_bool()?,
			OptionName::RcvSyn => self.post.rcv_syn = value.as_bool()?,
			OptionName::SndTimeo => self.post.snd_timeo_ms = Some(value.as_i64()? as u32),
			OptionName::RcvTimeo => self.post.rcv_timeo_ms = Some(value.as_i64()? as u32),
			OptionName::LossMaxTtl => self.post.lossmaxttl = value.as_i64()? as u32,
			OptionName::KmState | OptionName::SndKmState | OptionName::RcvKmState => return Err(ApiError::InvalidParameter.into()),
		}

		Ok(())
	}

	pub fn get(&self, name: OptionName) -> OptionValue {
		match name {
			OptionName::Mss => OptionValue::Int(self.pre.mss as i64),
			OptionName::Fc => OptionValue::Int(self.pre.fc as i64),
			OptionName::Latency => OptionValue::Int(self.pre.latency_ms as i64),
			OptionName::TsbpdMode => OptionValue::Bool(self.pre.tsbpd_mode),
			OptionName::Passphrase => OptionValue::Text(self.pre.passphrase.clone().unwrap_or_default()),
			OptionName::PbKeyLen => OptionValue::Int(self.pre.pbkeylen as i64),
			OptionName::EnforcedEncryption => OptionValue::Bool(self.pre.enforced_encryption),
			OptionName::MessageApi => OptionValue::Bool(self.pre.message_api),
			OptionName::PayloadSize => OptionValue::Int(self.pre.payload_size as i64),
			OptionName::StreamId => OptionValue::Text(self.pre.stream_id.clone()),
			OptionName::SndBuf => OptionValue::Int(self.post.sndbuf as i64),
			OptionName::RcvBuf => OptionValue::Int(self.post.rcvbuf as i64),
			OptionName::TlPktDrop => OptionValue::Bool(self.post.tlpktdrop),
			OptionName::NakReport => OptionValue::Bool(self.post.nakreport),
			OptionName::ConnTimeo => OptionValue::Int(self.post.conn_timeo_ms as i64),
			OptionName::SndSyn => OptionValue::Bool(self.post.snd_syn),
			OptionName::RcvSyn => OptionValue::Bool(self.post.rcv_syn),
			OptionName::SndTimeo => OptionValue::Int(self.post.snd_timeo_ms.unwrap_or(u32::MAX) as i64),
			OptionName::RcvTimeo => OptionValue::Int(self.post.rcv_timeo_ms.unwrap_or(u32::MAX) as i64),
			OptionName::LossMaxTtl => OptionValue::Int(self.post.lossmaxttl as i64),
			OptionName::KmState | OptionName::SndKmState | OptionName::RcvKmState => OptionValue::Int(0),
		}
	}
}

fn is_pre_option(name: OptionName) -> bool {
	matches!(
		name,
		OptionName::Mss
			| OptionName::Fc | OptionName::Latency
			| OptionName::TsbpdMode
			| OptionName::Passphrase
			| OptionName::PbKeyLen
			| OptionName::EnforcedEncryption
			| OptionName::MessageApi
			| OptionName::PayloadSize
			| OptionName::StreamId
	)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn pre_option_rejected_once_locked() {
		let mut opts = Options::default();
		opts.locked = true;
		let err = opts.set(OptionName::Mss, OptionValue::Int(1400)).unwrap_err();
		assert_eq!(err, Error::Api(ApiError::OptionLockedPostConnect));
	}

	#[test]
	fn post_option_still_settable_once_locked() {
		let mut opts = Options::default();
		opts.locked = true;
		opts.set(OptionName::RcvBuf, OptionValue::Int(4096)).unwrap();
		assert_eq!(opts.get(OptionName::RcvBuf), OptionValue::Int(4096));
	}

	#[test]
	fn pbkeylen_rejects_an_invalid_length() {
		let mut opts = Options::default();
		let err = opts.set(OptionName::PbKeyLen, OptionValue::Int(20)).unwrap_err();
		assert_eq!(err, Error::Api(ApiError::InvalidParameter));
	}

	#[test]
	fn wrong_value_kind_is_an_invalid_parameter() {
		let mut opts = Options::default();
		let err = opts.set(OptionName::Mss, OptionValue::Bool(true)).unwrap_err();
		assert_eq!(err, Error::Api(ApiError::InvalidParameter));
	}
}
