use std::collections::VecDeque;

use seqtime::{incseq, incseq_n, seqcmp, seqlen, seqoff};
use utils::error::Result;
use wire::PacketBoundary;

use crate::cell::Cell;
use crate::incmsgno;

/// Outcome of [`SendBuffer::add`]: the sequence and message numbers
/// assigned to the newly enqueued message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddOutcome {
	pub first_seq: u32,
	pub next_seq: u32,
	pub msgno: u32,
}

/// A message range that should be announced to the peer with a Drop
/// Request, because the retransmission that was asked for has already
/// expired past its TTL.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DropRange {
	pub msgno: u32,
	pub lo: u32,
	pub hi: u32,
}

/// Result of [`SendBuffer::read_old`].
pub enum ReadOld<'a> {
	Packet { payload: &'a [u8], boundary: PacketBoundary, inorder: bool, msgno: u32, origin_time_us: u64 },
	Drop(DropRange),
}

pub struct SendBuffer {
	cells: VecDeque<Cell>,
	capacity: usize,
	chunk_size: usize,
	/// Sequence number of `cells[0]`; the oldest un-acknowledged packet.
	/// `None` when the buffer is empty.
	base_seq: Option<u32>,
	/// Next sequence number `add` will assign.
	next_seq: u32,
	/// Next message number `add` will assign.
	next_msgno: u32,
	/// Index of the next cell `extract_unique` will return.
	unique_pos: usize,
	/// Earliest outstanding loss-group head, by sequence number.
	first_rexmit: Option<u32>,
}

impl SendBuffer {
	pub fn new(capacity: usize, chunk_size: usize, initial_seq: u32, initial_msgno: u32) -> Self {
		SendBuffer {
			cells: VecDeque::with_capacity(capacity),
			capacity,
			chunk_size,
			base_seq: None,
			next_seq: initial_seq,
			next_msgno: initial_msgno,
			unique_pos: 0,
			first_rexmit: None,
		}
	}

	fn index_of(&self, seq: u32) -> Option<usize> {
		let base = self.base_seq?;
		let off = seqoff(base, seq);
		(0..self.cells.len() as i64).contains(&off).then_some(off as usize)
	}

	fn free_slots(&self) -> usize {
		self.capacity.saturating_sub(self.cells.len())
	}

	/// Split `data` into packets of at most the configured chunk size and
	/// append them to the buffer, stamping PB flags, sequence and message
	/// numbers. Fails (back-pressure to the application) when there isn't
	/// room for every resulting packet.
	pub fn add(&mut self, data: &[u8], inorder: bool, origin_time_us: u64, ttl_ms: i64) -> Result<AddOutcome> {
		let chunks: Vec<&[u8]> = if data.is_empty() { vec![&[]] } else { data.chunks(self.chunk_size).collect() };

		if chunks.len() > self.free_slots() {
			log::warn!("send buffer full: need {} cells, have {} free", chunks.len(), self.free_slots());
			return Err(());
		}

		let msgno = self.next_msgno;
		self.next_msgno = incmsgno(msgno);

		let first_seq = self.next_seq;

		for (i, chunk) in chunks.iter().enumerate() {
			let boundary = match (i == 0, i == chunks.len() - 1) {
				(true, true) => PacketBoundary::Solo,
				(true, false) => PacketBoundary::First,
				(false, true) => PacketBoundary::Last,
				(false, false) => PacketBoundary::Middle,
			};

			let seq = self.next_seq;
			self.next_seq = incseq(self.next_seq);

			if self.base_seq.is_none() {
				self.base_seq = Some(seq);
			}

			self.cells.push_back(Cell::new(seq, msgno, boundary, inorder, chunk.to_vec(), origin_time_us, ttl_ms));
		}

		Ok(AddOutcome { first_seq, next_seq: self.next_seq, msgno })
	}

	/// Return the next packet that has never been sent, advancing the
	/// unique-send cursor. `None` once every stored packet has been sent
	/// at least once.
	pub fn extract_unique(&mut self) -> Option<(u32, &[u8], PacketBoundary, bool, u32, u64)> {
		let cell = self.cells.get(self.unique_pos)?;
		self.unique_pos += 1;
		Some((cell.seq, &cell.payload, cell.boundary, cell.inorder, cell.msgno, cell.origin_time_us))
	}

	/// Look up a previously-sent packet for retransmission. Returns the
	/// packet if its TTL has not expired, or a [`DropRange`] spanning the
	/// whole message it belongs to otherwise.
	pub fn read_old(&self, seq: u32, now_us: u64) -> Option<ReadOld<'_>> {
		let idx = self.index_of(seq)?;
		let cell = &self.cells[idx];

		if cell.ttl_ms >= 0 && now_us.saturating_sub(cell.origin_time_us) > cell.ttl_ms as u64 * 1000 {
			let (lo, hi) = self.message_range(idx);
			return Some(ReadOld::Drop(DropRange { msgno: cell.msgno, lo, hi }));
		}

		Some(ReadOld::Packet { payload: &cell.payload, boundary: cell.boundary, inorder: cell.inorder, msgno: cell.msgno, origin_time_us: cell.origin_time_us })
	}

	/// The full `(lo, hi)` sequence span of the message cell `idx` belongs
	/// to, as far as it is still present in the buffer.
	fn message_range(&self, idx: usize) -> (u32, u32) {
		let msgno = self.cells[idx].msgno;

		let mut lo = idx;
		while lo > 0 && self.cells[lo - 1].msgno == msgno {
			lo -= 1;
		}

		let mut hi = idx;
		while hi + 1 < self.cells.len() && self.cells[hi + 1].msgno == msgno {
			hi += 1;
		}

		(self.cells[lo].seq, self.cells[hi].seq)
	}

	/// Advance `first_unack` to `upto_seq`, freeing every cell before it.
	pub fn revoke(&mut self, upto_seq: u32) {
		let Some(base) = self.base_seq else { return };
		let advance = seqoff(base, upto_seq).max(0) as usize;
		let advance = advance.min(self.cells.len());

		for _ in 0..advance {
			self.cells.pop_front();
		}

		self.unique_pos = self.unique_pos.saturating_sub(advance);
		self.base_seq = self.cells.front().map(|c| c.seq);

		if let Some(head) = self.first_rexmit {
			if seqcmp(head, upto_seq) < 0 {
				self.first_rexmit = self.next_group_after(upto_seq);
			}
		}
	}

	/// Drop packets whose origin time is older than `too_late_time_us`.
	/// Returns the number of packets dropped and the first affected
	/// message number, if any were dropped.
	pub fn drop_late(&mut self, too_late_time_us: u64) -> (usize, Option<u32>) {
		let mut count = 0;
		let mut first_msgno = None;

		while let Some(cell) = self.cells.front() {
			if cell.origin_time_us >= too_late_time_us {
				break;
			}

			if first_msgno.is_none() {
				first_msgno = Some(cell.msgno);
			}

			self.cells.pop_front();
			count += 1;
		}

		if count > 0 {
			self.unique_pos = self.unique_pos.saturating_sub(count);
			self.base_seq = self.cells.front().map(|c| c.seq);
		}

		(count, first_msgno)
	}

	/// Find the seq of the first loss-group head at or after `from`.
	fn next_group_after(&self, from: u32) -> Option<u32> {
		let mut cursor = self.first_rexmit?;

		loop {
			if seqcmp(cursor, from) >= 0 {
				return Some(cursor);
			}

			let idx = self.index_of(cursor)?;
			let offset = self.cells[idx].next_group_offset;

			if offset == 0 {
				return None;
			}

			cursor = incseq_n(cursor, offset);
		}
	}

	/// Mark `[lo, hi]` lost, to be retransmitted no earlier than
	/// `next_rexmit_time_us`. Glues onto adjacent or overlapping groups;
	/// clips the range to what is still present in the buffer.
	pub fn insert_loss(&mut self, lo: u32, hi: u32, next_rexmit_time_us: u64) {
		let Some(base) = self.base_seq else { return };

		let lo = if seqcmp(lo, base) < 0 { base } else { lo };

		if seqcmp(lo, hi) > 0 {
			return;
		}

		let Some(last_idx) = self.index_of(hi).or_else(|| self.cells.len().checked_sub(1)) else { return };
		let hi = self.cells[last_idx].seq;

		if seqcmp(lo, hi) > 0 {
			return;
		}

		// Walk the existing chain, unlinking any group that the new range
		// overlaps or touches, and remember the insertion point.
		let mut prev: Option<u32> = None;
		let mut cursor = self.first_rexmit;
		let mut new_lo = lo;
		let mut new_hi = hi;

		while let Some(head) = cursor {
			let Some(idx) = self.index_of(head) else { break };
			let len = self.cells[idx].loss_len;
			let group_hi = incseq_n(head, len - 1);
			let next = self.cells[idx].next_group_offset;
			let next_head = if next == 0 { None } else { Some(incseq_n(head, next)) };

			let touches = seqcmp(head, incseq(new_hi)) <= 0 && seqcmp(new_lo, incseq(group_hi)) <= 0;

			if touches {
				if seqcmp(head, new_lo) < 0 {
					new_lo = head;
				}
				if seqcmp(group_hi, new_hi) > 0 {
					new_hi = group_hi;
				}

				self.cells[idx].loss_len = 0;
				self.cells[idx].next_group_offset = 0;
				cursor = next_head;
				continue;
			}

			if seqcmp(head, new_hi) > 0 {
				break;
			}

			prev = Some(head);
			cursor = next_head;
		}

		let Some(idx) = self.index_of(new_lo) else { return };
		let len = seqlen(new_lo, new_hi);
		self.cells[idx].loss_len = len;
		self.cells[idx].next_rexmit_time_us = Some(next_rexmit_time_us);
		self.cells[idx].next_group_offset = match cursor {
			Some(next_head) => seqoff(new_lo, next_head) as u32,
			None => 0,
		};

		match prev {
			Some(prev_head) => {
				if let Some(prev_idx) = self.index_of(prev_head) {
					self.cells[prev_idx].next_group_offset = seqoff(prev_head, new_lo) as u32;
				}
			}
			None => self.first_rexmit = Some(new_lo),
		}
	}

	/// Remove a single sequence from the loss schedule, splitting its
	/// group if it sits in the interior of a run.
	pub fn cancel_loss(&mut self, seq: u32) {
		let mut prev: Option<u32> = None;
		let mut cursor = self.first_rexmit;

		while let Some(head) = cursor {
			let Some(idx) = self.index_of(head) else { return };
			let len = self.cells[idx].loss_len;
			let group_hi = incseq_n(head, len - 1);
			let next_offset = self.cells[idx].next_group_offset;
			let next_head = if next_offset == 0 { None } else { Some(incseq_n(head, next_offset)) };

			if seqcmp(seq, head) < 0 || seqcmp(seq, group_hi) > 0 {
				prev = Some(head);
				cursor = next_head;
				continue;
			}

			let rexmit_time = self.cells[idx].next_rexmit_time_us;
			self.cells[idx].loss_len = 0;
			self.cells[idx].next_group_offset = 0;
			self.cells[idx].next_rexmit_time_us = None;

			if seq == head && seq == group_hi {
				// whole group removed
				self.relink(prev, next_head);
			} else if seq == head {
				let new_head = incseq(head);
				if let Some(new_idx) = self.index_of(new_head) {
					self.cells[new_idx].loss_len = len - 1;
					self.cells[new_idx].next_group_offset = next_offset.saturating_sub(1);
					self.cells[new_idx].next_rexmit_time_us = rexmit_time;
				}
				self.relink(prev, Some(new_head));
			} else if seq == group_hi {
				if let Some(head_idx) = self.index_of(head) {
					self.cells[head_idx].loss_len = len - 1;
					self.cells[head_idx].next_group_offset = next_offset;
					self.cells[head_idx].next_rexmit_time_us = rexmit_time;
				}
				self.relink(prev, Some(head));
			} else {
				// interior: split into [head, seq-1] and [seq+1, group_hi]
				let lower_len = seqlen(head, seq) - 1;
				if let Some(head_idx) = self.index_of(head) {
					self.cells[head_idx].loss_len = lower_len;
					self.cells[head_idx].next_rexmit_time_us = rexmit_time;
				}

				let upper_head = incseq(seq);
				let upper_len = seqlen(upper_head, group_hi);
				if let Some(upper_idx) = self.index_of(upper_head) {
					self.cells[upper_idx].loss_len = upper_len;
					self.cells[upper_idx].next_rexmit_time_us = rexmit_time;
					self.cells[upper_idx].next_group_offset = next_offset;
				}
				if let Some(head_idx) = self.index_of(head) {
					self.cells[head_idx].next_group_offset = seqoff(head, upper_head) as u32;
				}

				self.relink(prev, Some(head));
			}

			return;
		}
	}

	fn relink(&mut self, prev: Option<u32>, new_next: Option<u32>) {
		match prev {
			Some(prev_head) => {
				if let Some(idx) = self.index_of(prev_head) {
					self.cells[idx].next_group_offset = match new_next {
						Some(next) => seqoff(prev_head, next) as u32,
						None => 0,
					};
				}
			}
			None => self.first_rexmit = new_next,
		}
	}

	/// Return the next overdue lost sequence, or `None` if nothing is due
	/// yet. Consumes one sequence from its group (shrinking or removing
	/// it), matching the semantics of the real retransmit scan: each
	/// returned sequence is assumed about to be retransmitted.
	pub fn pop_lost_seq(&mut self, now_us: u64) -> Option<u32> {
		let head = self.first_rexmit?;
		let idx = self.index_of(head)?;

		let due = self.cells[idx].next_rexmit_time_us.map_or(true, |t| now_us >= t);

		if !due {
			return None;
		}

		let len = self.cells[idx].loss_len;
		let next_offset = self.cells[idx].next_group_offset;
		let rexmit_time = self.cells[idx].next_rexmit_time_us;
		let next_head = if next_offset == 0 { None } else { Some(incseq_n(head, next_offset)) };

		self.cells[idx].loss_len = 0;
		self.cells[idx].next_group_offset = 0;

		if len > 1 {
			let new_head = incseq(head);
			if let Some(new_idx) = self.index_of(new_head) {
				self.cells[new_idx].loss_len = len - 1;
				self.cells[new_idx].next_group_offset = next_offset.saturating_sub(1);
				self.cells[new_idx].next_rexmit_time_us = rexmit_time;
			}
			self.first_rexmit = Some(new_head);
		} else {
			self.first_rexmit = next_head;
		}

		Some(head)
	}

	pub fn len(&self) -> usize {
		self.cells.len()
	}

	pub fn is_empty(&self) -> bool {
		self.cells.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn buf() -> SendBuffer {
		SendBuffer::new(64, 4, 0, 0)
	}

	#[test]
	fn add_splits_into_chunks_and_stamps_boundaries() {
		let mut buf = buf();
		let outcome = buf.add(b"abcdefghij", true, 1000, -1).unwrap();
		assert_eq!(outcome.first_seq, 0);
		assert_eq!(outcome.next_seq, 3);
		assert_eq!(buf.len(), 3);

		assert_eq!(buf.cells[0].boundary, PacketBoundary::First);
		assert_eq!(buf.cells[1].boundary, PacketBoundary::Middle);
		assert_eq!(buf.cells[2].boundary, PacketBoundary::Last);
	}

	#[test]
	fn solo_message_gets_solo_boundary() {
		let mut buf = buf();
		buf.add(b"ab", true, 0, -1).unwrap();
		assert_eq!(buf.cells[0].boundary, PacketBoundary::Solo);
	}

	#[test]
	fn extract_unique_advances_and_exhausts() {
		let mut buf = buf();
		buf.add(b"abcd", true, 0, -1).unwrap();
		buf.add(b"ef", true, 0, -1).unwrap();

		assert!(buf.extract_unique().is_some());
		assert!(buf.extract_unique().is_some());
		assert!(buf.extract_unique().is_none());
	}

	#[test]
	fn revoke_frees_acknowledged_cells() {
		let mut buf = buf();
		buf.add(b"abcdefgh", true, 0, -1).unwrap();
		assert_eq!(buf.len(), 2);
		buf.revoke(1);
		assert_eq!(buf.len(), 1);
		assert_eq!(buf.cells[0].seq, 1);
	}

	#[test]
	fn read_old_returns_drop_after_ttl_expiry() {
		let mut buf = buf();
		buf.add(b"ab", true, 0, 10).unwrap();

		match buf.read_old(0, 5_000).unwrap() {
			ReadOld::Packet { .. } => {}
			ReadOld::Drop(_) => panic!("should still be live at 5ms"),
		}

		match buf.read_old(0, 50_000).unwrap() {
			ReadOld::Packet { .. } => panic!("should have expired by 50ms"),
			ReadOld::Drop(range) => assert_eq!(range.lo, 0),
		}
	}

	#[test]
	fn loss_insert_pop_and_cancel_round_trip() {
		let mut buf = buf();
		for _ in 0..10 {
			buf.add(b"x", true, 0, -1).unwrap();
		}

		buf.insert_loss(2, 4, 0);
		assert_eq!(buf.pop_lost_seq(0), Some(2));
		assert_eq!(buf.pop_lost_seq(0), Some(3));
		assert_eq!(buf.pop_lost_seq(0), Some(4));
		assert_eq!(buf.pop_lost_seq(0), None);
	}

	#[test]
	fn loss_not_due_yet_returns_none() {
		let mut buf = buf();
		for _ in 0..5 {
			buf.add(b"x", true, 0, -1).unwrap();
		}

		buf.insert_loss(1, 1, 10_000);
		assert_eq!(buf.pop_lost_seq(0), None);
		assert_eq!(buf.pop_lost_seq(10_000), Some(1));
	}

	#[test]
	fn cancel_loss_splits_interior_sequence() {
		let mut buf = buf();
		for _ in 0..10 {
			buf.add(b"x", true, 0, -1).unwrap();
		}

		buf.insert_loss(2, 6, 0);
		buf.cancel_loss(4);

		let mut got = vec![];
		while let Some(s) = buf.pop_lost_seq(0) {
			got.push(s);
		}
		got.sort();
		assert_eq!(got, vec![2, 3, 5, 6]);
	}

	#[test]
	fn adjacent_loss_ranges_glue_together() {
		let mut buf = buf();
		for _ in 0..10 {
			buf.add(b"x", true, 0, -1).unwrap();
		}

		buf.insert_loss(2, 3, 0);
		buf.insert_loss(4, 5, 0);

		let mut got = vec![];
		while let Some(s) = buf.pop_lost_seq(0) {
			got.push(s);
		}
		assert_eq!(got, vec![2, 3, 4, 5]);
	}

	#[test]
	fn add_fails_when_buffer_is_full() {
		let mut buf = SendBuffer::new(2, 4, 0, 0);
		buf.add(b"ab", true, 0, -1).unwrap();
		assert!(buf.add(b"abcdefgh", true, 0, -1).is_err());
	}
}
