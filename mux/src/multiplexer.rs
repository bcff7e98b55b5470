use std::net::SocketAddr;
use std::sync::Mutex;

use channel::Channel;
use log::{debug, warn};
use scheduler::Scheduler;
use wire::header::{Header, HEADER_LEN};

use crate::demux::DemuxTable;
use crate::epoll::{Epoll, Events};

/// Groups every connection sharing one UDP bind-address: the channel they
/// send and receive on, the socket-id/peer demux table, the send
/// scheduler, and the epoll readiness set application threads block on.
pub struct Multiplexer {
	pub channel: Channel,
	pub demux: Mutex<DemuxTable>,
	pub scheduler: Scheduler,
	pub epoll: Epoll,
}

impl Multiplexer {
	pub fn bind(addr: SocketAddr) -> utils::error::Result<Self> {
		Ok(Multiplexer { channel: Channel::bind(addr)?, demux: Mutex::new(DemuxTable::new()), scheduler: Scheduler::new(), epoll: Epoll::create() })
	}

	/// One iteration of the reader thread's loop: receive a datagram,
	/// decode its header, and route it by destination socket-id. Returns
	/// `false` on a would-block result (nothing to do this tick).
	pub fn reader_tick(&self) -> utils::error::Result<bool> {
		let mut buf = [0u8; 1500];
		let Some((n, peer, _info)) = self.channel.recv(&mut buf)? else {
			return Ok(false);
		};

		if n < HEADER_LEN {
			warn!("dropping undersized datagram from {peer} ({n} bytes)");
			return Ok(true);
		}

		let header_bytes: [u8; HEADER_LEN] = buf[..HEADER_LEN].try_into().unwrap();
		let Some(header) = Header::decode(&header_bytes) else {
			warn!("dropping malformed header from {peer}");
			return Ok(true);
		};

		let dest_id = match &header {
			Header::Data(h) => h.dest_socket_id,
			Header::Control(h) => h.dest_socket_id,
		};

		if DemuxTable::is_listener_bound(dest_id) {
			debug!("routing packet from {peer} to listener (dest id {dest_id})");
			// Handshake induction/conclusion handling lives with the
			// application-facing accept loop, which polls the listener's
			// own queue; nothing further to do on the reader thread.
			return Ok(true);
		}

		let mut demux = self.demux.lock().unwrap();
		match demux.get_mut(dest_id) {
			Some(entry) if entry.peer == peer => {
				self.epoll.notify(dest_id, Events { u: true, ..Events::NONE });
			}
			Some(_) => warn!("dropping packet for socket {dest_id}: peer address mismatch"),
			None => warn!("dropping packet for unknown socket {dest_id}"),
		}

		Ok(true)
	}

	/// One iteration of the sender thread's loop: pop whatever task is
	/// due (blocking until one is, or until interrupted) and report it so
	/// the caller can hand the corresponding packet to the channel.
	pub fn wait_next_send(&self, now_us: impl Fn() -> u64) -> scheduler::Next {
		self.scheduler.wait_for_due(now_us)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn bind_to_loopback_ephemeral_port_succeeds() {
		let mux = Multiplexer::bind("127.0.0.1:0".parse().unwrap()).unwrap();
		assert!(mux.channel.local_addr().unwrap().port() > 0);
	}

	#[test]
	fn reader_tick_on_idle_socket_returns_false() {
		let mux = Multiplexer::bind("127.0.0.1:0".parse().unwrap()).unwrap();
		assert!(!mux.reader_tick().unwrap());
	}

	#[test]
	fn undersized_datagram_is_dropped_without_error() {
		let mux = Multiplexer::bind("127.0.0.1:0".parse().unwrap()).unwrap();
		let sender = Channel::bind("127.0.0.1:0".parse().unwrap()).unwrap();

		sender.send(b"hi", mux.channel.local_addr().unwrap(), None).unwrap();
		std::thread::sleep(std::time::Duration::from_millis(20));

		assert!(mux.reader_tick().unwrap());
	}
}
