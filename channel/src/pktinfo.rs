use std::net::IpAddr;

/// The local address and interface a packet was received on, or the
/// local address a packet should be sent from. Only meaningful when the
/// channel is bound to a wildcard address (`0.0.0.0` / `::`); recovered
/// from `IP_PKTINFO` / `IPV6_RECVPKTINFO` ancillary data on receive, and
/// fed back on send so replies appear to originate from the same local
/// address the request arrived on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketInfo {
	pub local_addr: IpAddr,
	pub if_index: u32,
}
