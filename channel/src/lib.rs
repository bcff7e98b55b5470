//! The UDP channel: one socket shared by every connection multiplexed on
//! a local port. Packets are demultiplexed above this layer by
//! destination socket-id; this layer only knows how to get bytes to and
//! from the wire, recovering the local address a packet arrived on when
//! the socket is bound to a wildcard address.

mod pktinfo;
mod socket;

pub use pktinfo::PacketInfo;
pub use socket::Channel;
