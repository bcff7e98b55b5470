use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// A socket's readiness event mask: readable, writable, error, state-update.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Events {
	pub r: bool,
	pub w: bool,
	pub e: bool,
	pub u: bool,
}

impl Events {
	pub const NONE: Events = Events { r: false, w: false, e: false, u: false };

	pub fn is_empty(self) -> bool {
		self == Events::NONE
	}

	fn union(self, other: Events) -> Events {
		Events { r: self.r || other.r, w: self.w || other.w, e: self.e || other.e, u: self.u || other.u }
	}

	fn masked(self, interest: Events) -> Events {
		Events { r: self.r && interest.r, w: self.w && interest.w, e: self.e && interest.e, u: self.u && interest.u }
	}
}

pub type SocketId = u32;

struct Inner {
	/// Event mask each registered socket is interested in.
	interest: HashMap<SocketId, Events>,
	/// Events actually observed for each socket since it was last read out.
	ready: HashMap<SocketId, Events>,
	interrupted: bool,
}

/// One epoll instance: a set of (socket-id, interest-mask) registrations
/// plus a condition variable signaled whenever a registered socket's
/// readiness changes or `interrupt` is called.
pub struct Epoll {
	state: Mutex<Inner>,
	cv: Condvar,
}

impl Epoll {
	pub fn create() -> Self {
		Epoll { state: Mutex::new(Inner { interest: HashMap::new(), ready: HashMap::new(), interrupted: false }), cv: Condvar::new() }
	}

	pub fn add_usock(&self, id: SocketId, interest: Events) {
		let mut state = self.state.lock().unwrap();
		state.interest.insert(id, interest);
		state.ready.entry(id).or_insert(Events::NONE);
	}

	pub fn update_usock(&self, id: SocketId, interest: Events) {
		let mut state = self.state.lock().unwrap();
		state.interest.insert(id, interest);
	}

	pub fn remove_usock(&self, id: SocketId) {
		let mut state = self.state.lock().unwrap();
		state.interest.remove(&id);
		state.ready.remove(&id);
	}

	/// Record that `id` has transitioned into (at least) the given events
	/// and wake any waiter whose interest intersects them.
	pub fn notify(&self, id: SocketId, events: Events) {
		let mut state = self.state.lock().unwrap();
		if !state.interest.contains_key(&id) {
			return;
		}
		let merged = state.ready.get(&id).copied().unwrap_or(Events::NONE).union(events);
		state.ready.insert(id, merged);
		drop(state);
		self.cv.notify_all();
	}

	/// Block up to `timeout` (or forever if `None`) for at least one
	/// registered socket to have a nonempty masked-readiness set, or for
	/// `interrupt` to be called. Returns the ready (socket-id, events)
	/// pairs, clearing them from the pending set.
	pub fn wait(&self, timeout: Option<Duration>) -> Vec<(SocketId, Events)> {
		let mut state = self.state.lock().unwrap();

		let deadline = timeout.map(|t| std::time::Instant::now() + t);

		loop {
			if state.interrupted {
				state.interrupted = false;
				return Vec::new();
			}

			let due: Vec<SocketId> = state
				.ready
				.iter()
				.filter(|(id, ev)| {
					let interest = state.interest.get(id).copied().unwrap_or(Events::NONE);
					!ev.masked(interest).is_empty()
				})
				.map(|(id, _)| *id)
				.collect();

			if !due.is_empty() {
				let mut out = Vec::with_capacity(due.len());
				for id in due {
					let interest = state.interest.get(&id).copied().unwrap_or(Events::NONE);
					let ev = state.ready.remove(&id).unwrap_or(Events::NONE).masked(interest);
					out.push((id, ev));
				}
				return out;
			}

			match deadline {
				None => {
					state = self.cv.wait(state).unwrap();
				}
				Some(deadline) => {
					let now = std::time::Instant::now();
					if now >= deadline {
						return Vec::new();
					}
					let (next, timed_out) = self.cv.wait_timeout(state, deadline - now).unwrap();
					state = next;
					if timed_out.timed_out() && state.ready.is_empty() {
						return Vec::new();
					}
				}
			}
		}
	}

	/// Wake one blocked `wait` call immediately with an empty result.
	pub fn interrupt(&self) {
		let mut state = self.state.lock().unwrap();
		state.interrupted = true;
		drop(state);
		self.cv.notify_all();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn wait_returns_immediately_when_already_ready() {
		let epoll = Epoll::create();
		epoll.add_usock(1, Events { r: true, ..Events::NONE });
		epoll.notify(1, Events { r: true, ..Events::NONE });

		let ready = epoll.wait(Some(Duration::from_millis(50)));
		assert_eq!(ready, vec![(1, Events { r: true, ..Events::NONE })]);
	}

	#[test]
	fn wait_masks_events_outside_interest() {
		let epoll = Epoll::create();
		epoll.add_usock(1, Events { r: true, ..Events::NONE });
		epoll.notify(1, Events { w: true, ..Events::NONE });

		let ready = epoll.wait(Some(Duration::from_millis(20)));
		assert!(ready.is_empty(), "w-only event should not satisfy r-only interest");
	}

	#[test]
	fn wait_times_out_with_no_activity() {
		let epoll = Epoll::create();
		epoll.add_usock(1, Events { r: true, ..Events::NONE });
		let ready = epoll.wait(Some(Duration::from_millis(10)));
		assert!(ready.is_empty());
	}

	#[test]
	fn interrupt_wakes_a_blocked_wait() {
		let epoll = std::sync::Arc::new(Epoll::create());
		epoll.add_usock(1, Events { r: true, ..Events::NONE });

		let waiter = {
			let epoll = epoll.clone();
			std::thread::spawn(move || epoll.wait(None))
		};

		std::thread::sleep(Duration::from_millis(10));
		epoll.interrupt();

		let ready = waiter.join().unwrap();
		assert!(ready.is_empty());
	}

	#[test]
	fn remove_usock_drops_pending_readiness() {
		let epoll = Epoll::create();
		epoll.add_usock(1, Events { r: true, ..Events::NONE });
		epoll.notify(1, Events { r: true, ..Events::NONE });
		epoll.remove_usock(1);

		let ready = epoll.wait(Some(Duration::from_millis(10)));
		assert!(ready.is_empty());
	}
}
