use seqtime::{seqcmp, seqoff};
use wire::PacketBoundary;

use crate::cell::{Cell, CellState};
use crate::tsbpd::TimeBase;

/// Outcome of [`ReceiveBuffer::insert`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InsertOutcome {
	pub inserted: bool,
	/// Already held (or already delivered) this sequence; not an error.
	pub redundant: bool,
	/// Before `start_seq`; too old to matter.
	pub belated: bool,
	/// Past the buffer's capacity; the sender is running too far ahead.
	pub discrepancy: bool,
}

impl InsertOutcome {
	fn inserted() -> Self {
		InsertOutcome { inserted: true, redundant: false, belated: false, discrepancy: false }
	}
	fn redundant() -> Self {
		InsertOutcome { inserted: false, redundant: true, belated: false, discrepancy: false }
	}
	fn belated() -> Self {
		InsertOutcome { inserted: false, redundant: false, belated: true, discrepancy: false }
	}
	fn discrepancy() -> Self {
		InsertOutcome { inserted: false, redundant: false, belated: false, discrepancy: true }
	}
}

/// Report on the state of the buffer's head, used both to decide
/// readiness and to populate an ACK.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FirstValidPacketInfo {
	pub seq: u32,
	/// Whether a gap separates `start_seq` from this packet.
	pub seq_gap: bool,
	pub play_time: i64,
}

/// A complete message handed back to the application.
pub struct ReadMessage {
	pub payload: Vec<u8>,
	pub msgno: u32,
	pub lo: u32,
	pub hi: u32,
}

/// A cylinder of `capacity` cells, keyed by sequence number modulo
/// `capacity`. `start_pos`/`start_seq` mark the oldest retained packet;
/// `max_off` is the past-the-end offset of the most recently written
/// cell; `end_off` is the past-the-end offset of the contiguous run
/// starting at `start_pos`; `drop_off` is the offset of the first
/// available packet beyond a gap (0 when there is none).
pub struct ReceiveBuffer {
	cells: Vec<Cell>,
	capacity: usize,
	start_pos: usize,
	start_seq: u32,
	max_off: usize,
	end_off: usize,
	drop_off: usize,
	/// Offset below which every cell has already been read.
	first_nonread_off: usize,
	/// How many bytes of the head cell's payload `read_buffer` already
	/// consumed.
	notch: usize,
	out_of_order_enabled: bool,
	first_nonorder_msg_off: Option<usize>,
	tsbpd_enabled: bool,
	time_base: TimeBase,
}

impl ReceiveBuffer {
	pub fn new(capacity: usize, start_seq: u32, out_of_order_enabled: bool, tsbpd_enabled: bool, tsbpd_delay_us: i64) -> Self {
		ReceiveBuffer {
			cells: vec![Cell::default(); capacity],
			capacity,
			start_pos: 0,
			start_seq,
			max_off: 0,
			end_off: 0,
			drop_off: 0,
			first_nonread_off: 0,
			notch: 0,
			out_of_order_enabled,
			first_nonorder_msg_off: None,
			tsbpd_enabled,
			time_base: TimeBase::new(tsbpd_delay_us),
		}
	}

	pub fn time_base_mut(&mut self) -> &mut TimeBase {
		&mut self.time_base
	}

	fn ring_index(&self, off: usize) -> usize {
		(self.start_pos + off) % self.capacity
	}

	fn cell_at(&self, off: usize) -> &Cell {
		&self.cells[self.ring_index(off)]
	}

	fn is_available(&self, off: usize) -> bool {
		matches!(self.cell_at(off).state, CellState::Available | CellState::Read)
	}

	/// Recompute `end_off` and `drop_off` after an insertion or drop.
	fn recompute_offsets(&mut self) {
		let mut end = self.first_nonread_off.max(0);
		while end < self.max_off && self.is_available(end) {
			end += 1;
		}
		self.end_off = end;

		let mut gap = end;
		while gap < self.max_off && !self.is_available(gap) {
			gap += 1;
		}
		self.drop_off = if gap < self.max_off && gap > end { gap } else { 0 };
	}

	/// Walk backward from `off` (a cell belonging to message `msgno`) to
	/// the start of that message, then forward to confirm it is complete.
	/// Returns the `(start_off, end_off)` span if the whole message is
	/// present, contiguous, and unread.
	fn message_span(&self, off: usize, msgno: u32) -> Option<(usize, usize)> {
		let mut lo = off;
		while lo > 0 && self.is_available(lo - 1) && self.cell_at(lo - 1).msgno == msgno {
			lo -= 1;
		}
		if !matches!(self.cell_at(lo).boundary, PacketBoundary::First | PacketBoundary::Solo) {
			return None;
		}

		let mut hi = off;
		loop {
			if !self.is_available(hi) || self.cell_at(hi).msgno != msgno {
				return None;
			}
			if matches!(self.cell_at(hi).boundary, PacketBoundary::Last | PacketBoundary::Solo) {
				return Some((lo, hi));
			}
			if hi + 1 >= self.max_off {
				return None;
			}
			hi += 1;
		}
	}

	fn refresh_out_of_order_pointer(&mut self, off: usize, msgno: u32, inorder: bool) {
		if !self.out_of_order_enabled || inorder {
			return;
		}
		if let Some((lo, _)) = self.message_span(off, msgno) {
			self.first_nonorder_msg_off = Some(match self.first_nonorder_msg_off {
				Some(existing) => existing.min(lo),
				None => lo,
			});
		}
	}

	pub fn insert(&mut self, seq: u32, msgno: u32, boundary: PacketBoundary, inorder: bool, payload: Vec<u8>, timestamp_us: u32, arrival_time_us: u64) -> InsertOutcome {
		let off = seqoff(self.start_seq, seq);

		if off < 0 {
			return InsertOutcome::belated();
		}
		if off as usize >= self.capacity {
			return InsertOutcome::discrepancy();
		}

		let off = off as usize;
		let idx = self.ring_index(off);

		if !matches!(self.cells[idx].state, CellState::Empty) && self.cells[idx].seq == seq {
			return InsertOutcome::redundant();
		}

		self.cells[idx].occupy(seq, msgno, boundary, inorder, payload, timestamp_us, arrival_time_us);
		self.max_off = self.max_off.max(off + 1);

		if self.tsbpd_enabled {
			self.time_base.update_timebase(timestamp_us);
		}

		self.recompute_offsets();
		self.refresh_out_of_order_pointer(off, msgno, inorder);

		InsertOutcome::inserted()
	}

	/// Discard every cell before `seq`; they can never be filled now.
	/// Returns `(missing_dropped, discarded)`.
	pub fn drop_up_to(&mut self, seq: u32) -> (usize, usize) {
		let advance = (seqoff(self.start_seq, seq).max(0) as usize).min(self.capacity);

		let mut missing_dropped = 0;
		let mut discarded = 0;

		for off in 0..advance {
			let idx = self.ring_index(off);
			match self.cells[idx].state {
				CellState::Empty => missing_dropped += 1,
				CellState::Available => discarded += 1,
				_ => {}
			}
			self.cells[idx].clear();
		}

		self.start_seq = seqtime::incseq_n(self.start_seq, advance as u32);
		self.start_pos = self.ring_index(advance);
		self.max_off = self.max_off.saturating_sub(advance);
		self.first_nonread_off = self.first_nonread_off.saturating_sub(advance);
		self.first_nonorder_msg_off = self.first_nonorder_msg_off.and_then(|p| p.checked_sub(advance));
		self.notch = 0;

		self.recompute_offsets();

		(missing_dropped, discarded)
	}

	/// Drop a message's packets by sequence range. When `keep_existing` is
	/// set, an already-available cell is left in place (and scanning
	/// stops there) rather than being overwritten with an empty slot —
	/// the resolved behavior for a SOLO packet racing a drop request.
	pub fn drop_message(&mut self, lo: u32, hi: u32, msgno: u32, keep_existing: bool) -> usize {
		let mut count = 0;
		let mut seq = lo;

		loop {
			let off = seqoff(self.start_seq, seq);
			if off >= 0 && (off as usize) < self.capacity {
				let off = off as usize;
				let idx = self.ring_index(off);
				let cell_is_available = matches!(self.cells[idx].state, CellState::Available | CellState::Read);

				if cell_is_available && self.cells[idx].msgno == msgno {
					if keep_existing {
						break;
					}
					self.cells[idx].state = CellState::Dropped;
					count += 1;
				} else if matches!(self.cells[idx].state, CellState::Empty) {
					self.cells[idx].state = CellState::Dropped;
					self.cells[idx].seq = seq;
					self.cells[idx].msgno = msgno;
					count += 1;
				}

				self.max_off = self.max_off.max(off + 1);
			}

			if seq == hi {
				break;
			}
			seq = seqtime::incseq(seq);
		}

		self.recompute_offsets();
		count
	}

	/// Pull the next complete message, preferring the in-order head but
	/// falling back to an out-of-order message elsewhere in the buffer
	/// when out-of-order delivery is enabled.
	pub fn read_message(&mut self) -> Option<ReadMessage> {
		if let Some((lo_off, hi_off)) = self.message_span(0, self.cell_at(0).msgno).filter(|_| self.is_available(0)) {
			return Some(self.take_message(lo_off, hi_off));
		}

		if let Some(off) = self.first_nonorder_msg_off {
			let msgno = self.cell_at(off).msgno;
			if let Some((lo_off, hi_off)) = self.message_span(off, msgno) {
				return Some(self.take_message(lo_off, hi_off));
			}
		}

		None
	}

	fn take_message(&mut self, lo_off: usize, hi_off: usize) -> ReadMessage {
		let msgno = self.cell_at(lo_off).msgno;
		let lo = self.cell_at(lo_off).seq;
		let hi = self.cell_at(hi_off).seq;

		let mut payload = Vec::new();
		for off in lo_off..=hi_off {
			let idx = self.ring_index(off);
			payload.extend_from_slice(&self.cells[idx].payload);
			self.cells[idx].clear();
		}

		if lo_off == 0 {
			let advance = hi_off + 1;
			self.start_seq = seqtime::incseq_n(self.start_seq, advance as u32);
			self.start_pos = self.ring_index(advance);
			self.max_off = self.max_off.saturating_sub(advance);
			self.first_nonread_off = self.first_nonread_off.saturating_sub(advance);
			self.notch = 0;
		}

		if self.first_nonorder_msg_off == Some(lo_off) {
			self.first_nonorder_msg_off = None;
		}

		self.recompute_offsets();

		ReadMessage { payload, msgno, lo, hi }
	}

	/// Drain up to `max_len` contiguous bytes from the head of the buffer
	/// (stream mode), across partial packets; `notch` tracks how far into
	/// the head cell's payload the last call left off.
	pub fn read_buffer(&mut self, max_len: usize) -> Vec<u8> {
		let mut out = Vec::new();

		while out.len() < max_len && self.is_available(0) {
			let idx = self.ring_index(0);
			let remaining = &self.cells[idx].payload[self.notch..];
			let take = remaining.len().min(max_len - out.len());
			out.extend_from_slice(&remaining[..take]);
			self.notch += take;

			if self.notch < self.cells[idx].payload.len() {
				break;
			}

			self.cells[idx].clear();
			self.notch = 0;
			self.start_seq = seqtime::incseq(self.start_seq);
			self.start_pos = self.ring_index(1);
			self.max_off = self.max_off.saturating_sub(1);
			self.first_nonread_off = self.first_nonread_off.saturating_sub(1);
		}

		self.recompute_offsets();
		out
	}

	pub fn first_valid_packet_info(&self) -> Option<FirstValidPacketInfo> {
		let off = if self.is_available(0) { 0 } else if self.drop_off > 0 { self.drop_off } else { return None };

		let cell = self.cell_at(off);
		Some(FirstValidPacketInfo { seq: cell.seq, seq_gap: off > 0, play_time: self.time_base.play_time(cell.timestamp_us) })
	}

	pub fn first_loss_seq(&self, from: u32) -> Option<(u32, Option<u32>)> {
		let start_off = seqoff(self.start_seq, from).max(0) as usize;

		let mut off = start_off;
		while off < self.max_off && self.is_available(off) {
			off += 1;
		}
		if off >= self.max_off {
			return None;
		}

		let lo = seqtime::incseq_n(self.start_seq, off as u32);
		let mut end = off;
		while end < self.max_off && !self.is_available(end) {
			end += 1;
		}
		let hi = seqtime::decseq(seqtime::incseq_n(self.start_seq, end as u32));

		Some((lo, if seqcmp(hi, lo) > 0 { Some(hi) } else { None }))
	}

	/// TSBPD-aware readiness check for the head of the buffer.
	pub fn is_rcv_data_ready(&self, now_us: i64) -> bool {
		if !self.is_available(0) {
			return false;
		}
		if !self.tsbpd_enabled {
			return true;
		}
		self.time_base.is_ready(self.cell_at(0).timestamp_us, now_us)
	}

	pub fn capacity(&self) -> usize {
		self.capacity
	}

	pub fn start_seq(&self) -> u32 {
		self.start_seq
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn buf() -> ReceiveBuffer {
		ReceiveBuffer::new(16, 0, false, false, 0)
	}

	#[test]
	fn insert_redundant_is_a_no_op() {
		let mut buf = buf();
		let first = buf.insert(0, 0, PacketBoundary::Solo, true, b"x".to_vec(), 0, 0);
		assert!(first.inserted);
		let second = buf.insert(0, 0, PacketBoundary::Solo, true, b"x".to_vec(), 0, 0);
		assert!(second.redundant);
	}

	#[test]
	fn insert_before_start_seq_is_belated() {
		let mut buf = ReceiveBuffer::new(16, 10, false, false, 0);
		let outcome = buf.insert(5, 0, PacketBoundary::Solo, true, vec![], 0, 0);
		assert!(outcome.belated);
	}

	#[test]
	fn insert_past_capacity_is_discrepancy() {
		let mut buf = ReceiveBuffer::new(4, 0, false, false, 0);
		let outcome = buf.insert(10, 0, PacketBoundary::Solo, true, vec![], 0, 0);
		assert!(outcome.discrepancy);
	}

	#[test]
	fn read_message_reassembles_multi_packet_message() {
		let mut buf = buf();
		buf.insert(0, 1, PacketBoundary::First, true, b"ab".to_vec(), 0, 0);
		buf.insert(1, 1, PacketBoundary::Middle, true, b"cd".to_vec(), 0, 0);
		buf.insert(2, 1, PacketBoundary::Last, true, b"ef".to_vec(), 0, 0);

		let msg = buf.read_message().expect("message should be complete");
		assert_eq!(msg.payload, b"abcdef");
		assert_eq!((msg.lo, msg.hi), (0, 2));
		assert!(buf.read_message().is_none());
	}

	#[test]
	fn read_message_waits_for_missing_middle_packet() {
		let mut buf = buf();
		buf.insert(0, 1, PacketBoundary::First, true, b"ab".to_vec(), 0, 0);
		buf.insert(2, 1, PacketBoundary::Last, true, b"ef".to_vec(), 0, 0);
		assert!(buf.read_message().is_none());
	}

	#[test]
	fn first_valid_packet_info_reports_gap() {
		let mut buf = buf();
		buf.insert(1, 0, PacketBoundary::Solo, true, b"x".to_vec(), 0, 0);
		let info = buf.first_valid_packet_info().unwrap();
		assert_eq!(info.seq, 1);
		assert!(info.seq_gap);
	}

	#[test]
	fn first_loss_seq_reports_single_missing_packet() {
		let mut buf = buf();
		buf.insert(0, 0, PacketBoundary::Solo, true, b"x".to_vec(), 0, 0);
		buf.insert(2, 0, PacketBoundary::Solo, true, b"y".to_vec(), 0, 0);
		let (lo, hi) = buf.first_loss_seq(0).expect("one packet missing");
		assert_eq!(lo, 1);
		assert_eq!(hi, None);
	}

	#[test]
	fn tsbpd_readiness_matches_configured_delay_boundary() {
		let mut buf = ReceiveBuffer::new(16, 0, false, true, 200_000);
		buf.time_base_mut().set(1_000_000, false, 200_000);
		buf.insert(0, 0, PacketBoundary::Solo, true, b"x".to_vec(), 0, 1_000_000);

		assert!(!buf.is_rcv_data_ready(1_000_000 + 199_000));
		assert!(buf.is_rcv_data_ready(1_000_000 + 200_000));
	}

	#[test]
	fn drop_up_to_advances_start_and_counts_missing() {
		let mut buf = buf();
		buf.insert(1, 0, PacketBoundary::Solo, true, b"x".to_vec(), 0, 0);
		let (missing, discarded) = buf.drop_up_to(2);
		assert_eq!(missing, 1, "seq 0 was never received");
		assert_eq!(discarded, 1, "seq 1 was available but dropped");
		assert_eq!(buf.start_seq(), 2);
	}

	#[test]
	fn read_buffer_drains_across_partial_packets() {
		let mut buf = buf();
		buf.insert(0, 0, PacketBoundary::First, true, b"abcd".to_vec(), 0, 0);
		buf.insert(1, 0, PacketBoundary::Last, true, b"efgh".to_vec(), 0, 0);

		assert_eq!(buf.read_buffer(3), b"abc");
		assert_eq!(buf.read_buffer(3), b"def");
		assert_eq!(buf.read_buffer(3), b"gh");
	}

	#[test]
	fn out_of_order_message_is_delivered_ahead_of_a_stalled_head() {
		let mut buf = ReceiveBuffer::new(16, 0, true, false, 0);
		buf.insert(5, 9, PacketBoundary::Solo, false, b"late-but-ready".to_vec(), 0, 0);

		let msg = buf.read_message().expect("out-of-order message should be deliverable");
		assert_eq!(msg.payload, b"late-but-ready");
	}
}
