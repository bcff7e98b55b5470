//! Every public API call returns `Result<T, Error>`. Internally,
//! `transport`/`sndbuf`/`rcvbuf` use the lighter `utils::error::Result<T>`;
//! the connection state machine is the translation point, turning an
//! internal failure plus its last-recorded reason into one of these at the
//! API boundary.

use thiserror::Error;

use transport::RejectReason;

/// A handshake was rejected or never completed.
#[derive(Error, Clone, Copy, PartialEq, Eq, Debug)]
pub enum SetupError {
	#[error("handshake timed out")]
	Timeout,
	#[error("listener syn cookie did not match")]
	CookieMismatch,
	#[error("peer protocol version is incompatible")]
	Version,
	#[error("peer failed rendezvous verification")]
	RoguePeer,
	#[error("encryption is enforced but the key exchange failed")]
	BadSecret,
	#[error("socket was closed while the handshake was outstanding")]
	ClosedDuringHandshake,
	#[error("listener backlog is full")]
	BacklogExceeded,
	#[error("peer requested an incompatible stream id")]
	ApiCollision,
	#[error("peer requested an incompatible congestion controller")]
	CongestionControllerCollision,
	#[error("peer requested an incompatible packet filter")]
	FilterCollision,
	#[error("peer requested an incompatible group configuration")]
	GroupCollision,
	#[error("peer's protocol version is too old")]
	PeerVersionTooOld,
}

impl From<RejectReason> for SetupError {
	fn from(reason: RejectReason) -> Self {
		match reason {
			RejectReason::Timeout => SetupError::Timeout,
			RejectReason::CookieMismatch => SetupError::CookieMismatch,
			RejectReason::Version => SetupError::Version,
			RejectReason::RoguePeer => SetupError::RoguePeer,
			RejectReason::BadSecret => SetupError::BadSecret,
			RejectReason::ClosedDuringHandshake => SetupError::ClosedDuringHandshake,
			RejectReason::BacklogExceeded => SetupError::BacklogExceeded,
			RejectReason::ApiCollision => SetupError::ApiCollision,
			RejectReason::CongestionControllerCollision => SetupError::CongestionControllerCollision,
			RejectReason::FilterCollision => SetupError::FilterCollision,
			RejectReason::GroupCollision => SetupError::GroupCollision,
			RejectReason::PeerVersionTooOld => SetupError::PeerVersionTooOld,
			RejectReason::Unknown => SetupError::Timeout,
		}
	}
}

/// The connection itself is no longer usable.
#[derive(Error, Clone, Copy, PartialEq, Eq, Debug)]
pub enum ConnError {
	#[error("connection is broken")]
	Broken,
	#[error("socket does not exist")]
	Nonexist,
}

/// A resource the process needed could not be obtained.
#[derive(Error, Clone, PartialEq, Eq, Debug)]
pub enum SystemError {
	#[error("failed to spawn a worker thread: {0}")]
	ThreadSpawn(String),
	#[error("failed to allocate a socket-id: table is full")]
	SocketTableFull,
	#[error("I/O error: {0}")]
	Io(String),
}

/// The caller used the API incorrectly, independent of network state.
#[derive(Error, Clone, Copy, PartialEq, Eq, Debug)]
pub enum ApiError {
	#[error("socket is not bound to a local address")]
	NotBound,
	#[error("socket is already connected")]
	AlreadyConnected,
	#[error("no socket exists with that id")]
	InvalidSocketId,
	#[error("invalid parameter for this call")]
	InvalidParameter,
	#[error("operation not valid in message-API mode")]
	InvalidMessageApiUse,
	#[error("socket is not listening")]
	NotListening,
	#[error("operation violates rendezvous-mode rules")]
	RendezvousRules,
	#[error("option cannot be changed after connect")]
	OptionLockedPostConnect,
}

/// The call would have blocked; only returned from non-blocking sockets.
#[derive(Error, Clone, Copy, PartialEq, Eq, Debug)]
pub enum AgainError {
	#[error("write would block")]
	WriteWouldBlock,
	#[error("read would block")]
	ReadWouldBlock,
	#[error("operation timed out")]
	Timeout,
	#[error("early congestion notification")]
	Congestion,
}

#[derive(Error, Clone, PartialEq, Eq, Debug)]
pub enum Error {
	#[error("setup failed: {0}")]
	Setup(#[from] SetupError),
	#[error("connection error: {0}")]
	Connection(#[from] ConnError),
	#[error("system error: {0}")]
	System(#[from] SystemError),
	#[error("api misuse: {0}")]
	Api(#[from] ApiError),
	#[error("would block: {0}")]
	Again(#[from] AgainError),
	#[error("peer reported error code {0}")]
	Peer(u32),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn reject_reason_maps_to_matching_setup_error() {
		assert_eq!(SetupError::from(RejectReason::CookieMismatch), SetupError::CookieMismatch);
		assert_eq!(SetupError::from(RejectReason::BacklogExceeded), SetupError::BacklogExceeded);
	}

	#[test]
	fn error_display_reads_as_a_sentence() {
		let e: Error = ApiError::NotBound.into();
		assert_eq!(e.to_string(), "api misuse: socket is not bound to a local address");
	}
}
