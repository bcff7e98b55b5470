use seqtime::{seqcmp, seqlen};

/// One contiguous range of sequences the receiver has not yet seen.
/// `fresh_ttl` counts down in ACK cycles (per §9 of the distilled
/// specification, which fixes the fresh-loss TTL unit as ACK cycles
/// rather than wall-clock time); a range is only eligible to be
/// NAK-reported again once its TTL reaches zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LossEntry {
	pub lo: u32,
	pub hi: u32,
	pub fresh_ttl: u32,
}

/// The receiver's view of which sequences are missing: a sorted list of
/// disjoint ranges, each carrying a fresh-loss TTL.
#[derive(Default)]
pub struct ReceiverLossList {
	entries: Vec<LossEntry>,
	default_ttl: u32,
}

impl ReceiverLossList {
	pub fn new(default_ttl: u32) -> Self {
		ReceiverLossList { entries: Vec::new(), default_ttl }
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn len(&self) -> usize {
		self.entries.iter().map(|e| seqlen(e.lo, e.hi) as usize).sum()
	}

	/// Record `[lo, hi]` as missing, merging with any adjacent or
	/// overlapping range, and mark it immediately eligible for NAK.
	pub fn insert(&mut self, lo: u32, hi: u32) {
		let mut merged_lo = lo;
		let mut merged_hi = hi;

		self.entries.retain(|e| {
			let touches = seqcmp(e.lo, inc(merged_hi)) <= 0 && seqcmp(merged_lo, inc(e.hi)) <= 0;
			if touches {
				if seqcmp(e.lo, merged_lo) < 0 {
					merged_lo = e.lo;
				}
				if seqcmp(e.hi, merged_hi) > 0 {
					merged_hi = e.hi;
				}
			}
			!touches
		});

		self.entries.push(LossEntry { lo: merged_lo, hi: merged_hi, fresh_ttl: 0 });
		self.entries.sort_by(|a, b| seqcmp(a.lo, b.lo).cmp(&0));
	}

	/// Remove `seq` from the loss list (it has now been received),
	/// splitting its entry if `seq` sits in the interior of a range.
	pub fn remove(&mut self, seq: u32) {
		let mut new_entries = Vec::with_capacity(self.entries.len() + 1);

		for e in &self.entries {
			if seqcmp(seq, e.lo) < 0 || seqcmp(seq, e.hi) > 0 {
				new_entries.push(*e);
				continue;
			}

			if seqcmp(e.lo, e.hi) == 0 {
				continue;
			}

			if seq == e.lo {
				new_entries.push(LossEntry { lo: seqtime::incseq(e.lo), hi: e.hi, fresh_ttl: e.fresh_ttl });
			} else if seq == e.hi {
				new_entries.push(LossEntry { lo: e.lo, hi: seqtime::decseq(e.hi), fresh_ttl: e.fresh_ttl });
			} else {
				new_entries.push(LossEntry { lo: e.lo, hi: seqtime::decseq(seq), fresh_ttl: e.fresh_ttl });
				new_entries.push(LossEntry { lo: seqtime::incseq(seq), hi: e.hi, fresh_ttl: e.fresh_ttl });
			}
		}

		self.entries = new_entries;
	}

	/// Remove every sequence before `start_seq` (the buffer has advanced
	/// past them; they can never be received now).
	pub fn drop_before(&mut self, start_seq: u32) {
		self.entries.retain_mut(|e| {
			if seqcmp(e.hi, start_seq) < 0 {
				return false;
			}
			if seqcmp(e.lo, start_seq) < 0 {
				e.lo = start_seq;
			}
			true
		});
	}

	/// Ranges currently eligible for a NAK report (fresh_ttl == 0), and
	/// reset their TTL so they won't be reported again until it expires.
	pub fn due_for_nak(&mut self) -> Vec<LossEntry> {
		let mut due = Vec::new();

		for e in self.entries.iter_mut() {
			if e.fresh_ttl == 0 {
				due.push(*e);
				e.fresh_ttl = self.default_ttl;
			}
		}

		due
	}

	/// Advance one ACK cycle, counting down every range's fresh-loss TTL.
	pub fn tick_ack_cycle(&mut self) {
		for e in self.entries.iter_mut() {
			e.fresh_ttl = e.fresh_ttl.saturating_sub(1);
		}
	}

	pub fn first(&self) -> Option<LossEntry> {
		self.entries.first().copied()
	}
}

fn inc(s: u32) -> u32 {
	seqtime::incseq(s)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn insert_and_due_for_nak() {
		let mut list = ReceiverLossList::new(2);
		list.insert(5, 7);
		let due = list.due_for_nak();
		assert_eq!(due, vec![LossEntry { lo: 5, hi: 7, fresh_ttl: 0 }]);
		assert!(list.due_for_nak().is_empty(), "ttl should now be armed");
	}

	#[test]
	fn tick_ack_cycle_eventually_rearms() {
		let mut list = ReceiverLossList::new(2);
		list.insert(5, 7);
		list.due_for_nak();
		list.tick_ack_cycle();
		assert!(list.due_for_nak().is_empty());
		list.tick_ack_cycle();
		assert_eq!(list.due_for_nak().len(), 1);
	}

	#[test]
	fn remove_splits_interior_sequence() {
		let mut list = ReceiverLossList::new(0);
		list.insert(10, 14);
		list.remove(12);
		assert_eq!(list.entries, vec![LossEntry { lo: 10, hi: 11, fresh_ttl: 0 }, LossEntry { lo: 13, hi: 14, fresh_ttl: 0 }]);
	}

	#[test]
	fn remove_single_entry_empties_list() {
		let mut list = ReceiverLossList::new(0);
		list.insert(10, 10);
		list.remove(10);
		assert!(list.is_empty());
	}

	#[test]
	fn adjacent_inserts_merge() {
		let mut list = ReceiverLossList::new(0);
		list.insert(1, 2);
		list.insert(3, 4);
		assert_eq!(list.len(), 4);
		assert_eq!(list.entries.len(), 1);
	}

	#[test]
	fn drop_before_clips_or_removes() {
		let mut list = ReceiverLossList::new(0);
		list.insert(1, 10);
		list.drop_before(5);
		assert_eq!(list.entries, vec![LossEntry { lo: 5, hi: 10, fresh_ttl: 0 }]);
	}
}
