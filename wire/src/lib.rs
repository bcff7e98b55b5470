//! On-wire packet header encode/decode. A packet is either a data packet
//! (payload-carrying, sequenced) or a control packet (handshake, ACK, NAK,
//! keepalive, shutdown, ...); the two share a 16-byte header and are told
//! apart by the top bit of the first field.
//!
//! All multi-byte fields are big-endian on the wire, matching network byte
//! order; [`utils::endian`] provides the `bNN` wrapper types that encode
//! that swap into the type, so a correctly-typed header struct can be cast
//! directly onto a receive buffer without a manual parse step.

pub mod control;
pub mod header;

pub use control::{ControlBody, ControlType};
pub use header::{DataFlags, DataHeader, Header, PacketBoundary, HEADER_LEN};
