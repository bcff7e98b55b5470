//! Sequence-number arithmetic, the steady (monotonic) clock, and the
//! timestamp drift tracker shared by the send/receive buffers and the
//! TSBPD time base.

pub mod clock;
pub mod drift;
pub mod seq;

pub use clock::SteadyClock;
pub use drift::DriftTracker;
pub use seq::{decseq, decseq_n, incseq, incseq_n, is_none, seqcmp, seqlen, seqoff, Seq, MAX_SEQ, SEQ_NONE};
