use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

use crate::ConnId;

/// What kind of packet a scheduled task represents.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TaskKind {
	Regular,
	Retransmit,
	Control,
}

/// A single scheduled send. `order` breaks ties between equal `send_at_us`
/// values in insertion order (FIFO).
#[derive(Clone, Copy, Debug)]
pub struct Task {
	pub conn: ConnId,
	pub seq: u32,
	pub kind: TaskKind,
	pub send_at_us: u64,
	order: u64,
}

#[derive(PartialEq, Eq)]
struct HeapKey {
	send_at_us: u64,
	order: u64,
}

impl PartialOrd for HeapKey {
	fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for HeapKey {
	fn cmp(&self, other: &Self) -> std::cmp::Ordering {
		(self.send_at_us, self.order).cmp(&(other.send_at_us, other.order))
	}
}

struct Entry {
	key: HeapKey,
	task: Task,
}

impl PartialEq for Entry {
	fn eq(&self, other: &Self) -> bool {
		self.key == other.key
	}
}

impl Eq for Entry {}

impl PartialOrd for Entry {
	fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for Entry {
	fn cmp(&self, other: &Self) -> std::cmp::Ordering {
		self.key.cmp(&other.key)
	}
}

pub struct TaskHeap {
	heap: BinaryHeap<Reverse<Entry>>,
	withdrawn: HashSet<ConnId>,
	next_order: u64,
}

impl TaskHeap {
	pub fn new() -> Self {
		TaskHeap { heap: BinaryHeap::new(), withdrawn: HashSet::new(), next_order: 0 }
	}

	pub fn push(&mut self, conn: ConnId, seq: u32, kind: TaskKind, send_at_us: u64) {
		self.withdrawn.remove(&conn);
		let order = self.next_order;
		self.next_order += 1;

		let task = Task { conn, seq, kind, send_at_us, order };
		self.heap.push(Reverse(Entry { key: HeapKey { send_at_us, order }, task }));
	}

	/// Mark every task currently belonging to `conn` (and any scheduled
	/// after this call, until it schedules again) as withdrawn.
	pub fn withdraw(&mut self, conn: ConnId) {
		self.withdrawn.insert(conn);
	}

	/// Discard withdrawn tasks sitting at the top of the heap.
	pub fn drop_withdrawn(&mut self) {
		while let Some(Reverse(entry)) = self.heap.peek() {
			if self.withdrawn.contains(&entry.task.conn) {
				self.heap.pop();
			} else {
				break;
			}
		}
	}

	pub fn peek_due_time(&mut self) -> Option<u64> {
		self.drop_withdrawn();
		self.heap.peek().map(|Reverse(entry)| entry.key.send_at_us)
	}

	pub fn pop(&mut self) -> Option<Task> {
		self.drop_withdrawn();
		self.heap.pop().map(|Reverse(entry)| entry.task)
	}

	pub fn len(&self) -> usize {
		self.heap.len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn withdrawn_connection_tasks_are_skipped() {
		let mut heap = TaskHeap::new();
		heap.push(1, 0, TaskKind::Regular, 100);
		heap.push(2, 0, TaskKind::Regular, 200);
		heap.withdraw(1);

		assert_eq!(heap.pop().map(|t| t.conn), Some(2));
		assert_eq!(heap.pop(), None);
	}

	#[test]
	fn rescheduling_after_withdrawal_unwithdraws() {
		let mut heap = TaskHeap::new();
		heap.push(1, 0, TaskKind::Regular, 100);
		heap.withdraw(1);
		heap.push(1, 1, TaskKind::Regular, 50);

		assert_eq!(heap.pop().map(|t| t.seq), Some(1));
	}
}
