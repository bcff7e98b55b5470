//! The send buffer: splits outgoing messages into packets, hands out the
//! next unsent packet, serves retransmission lookups, and carries the
//! sender-side loss schedule inline in the same cell array (no separate
//! loss-list container).

mod buffer;
mod cell;

pub use buffer::{AddOutcome, DropRange, ReadOld, SendBuffer};
pub use cell::Cell;

/// Message-number space is 29 bits, wrapping.
pub const MSGNO_BITS: u32 = 29;
const MSGNO_MOD: u64 = 1 << MSGNO_BITS;

/// Advance a message number by one, wrapping at 2^29.
pub fn incmsgno(m: u32) -> u32 {
	((m as u64 + 1) % MSGNO_MOD) as u32
}
