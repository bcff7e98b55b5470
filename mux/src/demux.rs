use std::collections::HashMap;
use std::net::SocketAddr;

use transport::Connection;

/// Well-known local socket-id of the listening socket.
pub const LISTENER_SOCKET_ID: u32 = 1;

/// One multiplexed connection, keyed in the demux table by its local
/// socket-id and the peer it talks to.
pub struct Entry {
	pub peer: SocketAddr,
	pub conn: Connection,
}

/// Maps (destination socket-id, peer address) to a connection. Packets
/// addressed to socket-id 0 or the well-known listener id are routed to
/// the listener instead, since the peer hasn't been assigned a
/// connection-specific id yet during induction.
#[derive(Default)]
pub struct DemuxTable {
	entries: HashMap<u32, Entry>,
	next_id: u32,
}

impl DemuxTable {
	pub fn new() -> Self {
		// Socket-ids are 24-bit and process-unique; id 1 is reserved for
		// the listener, so connection ids start at 2.
		DemuxTable { entries: HashMap::new(), next_id: 2 }
	}

	/// Allocate the next connection socket-id, wrapping within the 24-bit
	/// range and skipping ids already in use or reserved.
	pub fn allocate_id(&mut self) -> u32 {
		const MAX_ID: u32 = (1 << 24) - 1;
		loop {
			let id = self.next_id;
			self.next_id = if self.next_id >= MAX_ID { 2 } else { self.next_id + 1 };
			if id != LISTENER_SOCKET_ID && !self.entries.contains_key(&id) {
				return id;
			}
		}
	}

	pub fn insert(&mut self, id: u32, peer: SocketAddr, conn: Connection) {
		self.entries.insert(id, Entry { peer, conn });
	}

	pub fn remove(&mut self, id: u32) -> Option<Entry> {
		self.entries.remove(&id)
	}

	/// Whether `dest_id` should be routed to the listener rather than to
	/// an established connection: either the induction-stage sentinel (0)
	/// or the listener's own well-known id.
	pub fn is_listener_bound(dest_id: u32) -> bool {
		dest_id == 0 || dest_id == LISTENER_SOCKET_ID
	}

	pub fn get_mut(&mut self, id: u32) -> Option<&mut Entry> {
		self.entries.get_mut(&id)
	}

	pub fn get(&self, id: u32) -> Option<&Entry> {
		self.entries.get(&id)
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
		self.entries.keys().copied()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use transport::Role;

	fn peer() -> SocketAddr {
		"127.0.0.1:9000".parse().unwrap()
	}

	#[test]
	fn induction_and_listener_ids_route_to_listener() {
		assert!(DemuxTable::is_listener_bound(0));
		assert!(DemuxTable::is_listener_bound(LISTENER_SOCKET_ID));
		assert!(!DemuxTable::is_listener_bound(2));
	}

	#[test]
	fn allocate_id_skips_the_listener_id_and_in_use_ids() {
		let mut table = DemuxTable::new();
		let first = table.allocate_id();
		assert_ne!(first, LISTENER_SOCKET_ID);

		table.insert(first, peer(), Connection::new(Role::Listener, 0, 30_000_000));
		let second = table.allocate_id();
		assert_ne!(second, first);
		assert_ne!(second, LISTENER_SOCKET_ID);
	}

	#[test]
	fn insert_then_remove_round_trips() {
		let mut table = DemuxTable::new();
		let id = table.allocate_id();
		table.insert(id, peer(), Connection::new(Role::Caller, 0, 30_000_000));

		assert!(table.get(id).is_some());
		assert_eq!(table.len(), 1);

		let removed = table.remove(id).unwrap();
		assert_eq!(removed.peer, peer());
		assert!(table.is_empty());
	}
}
