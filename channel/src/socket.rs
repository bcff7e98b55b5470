use std::net::{SocketAddr, UdpSocket};

use log::{error, warn};
use utils::error::Result;

use crate::pktinfo::PacketInfo;

/// Run an I/O operation, logging and collapsing any error to `()` per the
/// log-at-error-site convention the rest of the workspace follows.
fn logged<T>(r: std::io::Result<T>, msg: &str) -> Result<T> {
	r.map_err(|e| error!("{msg}: {e}"))
}

/// A single non-blocking UDP socket shared by every connection the
/// multiplexer above this layer is driving. `recv`/`send` are raw,
/// per-packet operations; socket-id demultiplexing and the scheduler's
/// queueing live above this layer.
pub struct Channel {
	socket: UdpSocket,
	wildcard_bound: bool,
}

impl Channel {
	/// Bind a new channel. If `addr` is a wildcard address (`0.0.0.0` /
	/// `::`), enables packet-info ancillary data so the local address a
	/// packet arrived on can be recovered and mirrored back on send.
	pub fn bind(addr: SocketAddr) -> Result<Self> {
		let socket = logged(UdpSocket::bind(addr), "failed to bind UDP channel")?;
		logged(socket.set_nonblocking(true), "failed to set channel non-blocking")?;

		let wildcard_bound = cfg!(unix) && addr.ip().is_unspecified();

		if wildcard_bound {
			sys::enable_pktinfo(&socket, addr.is_ipv6())?;
		}

		Ok(Channel { socket, wildcard_bound })
	}

	pub fn local_addr(&self) -> Result<SocketAddr> {
		logged(self.socket.local_addr(), "failed to read channel local address")
	}

	/// Receive one datagram. Returns the peer address and, when this
	/// channel is wildcard-bound, the local `PacketInfo` the datagram
	/// arrived on. `Ok(None)` on a would-block result (non-blocking
	/// socket, no datagram pending).
	pub fn recv(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr, Option<PacketInfo>)>> {
		if self.wildcard_bound {
			match sys::recvmsg(&self.socket, buf) {
				Ok(Some((n, peer, info))) => Ok(Some((n, peer, info))),
				Ok(None) => Ok(None),
				Err(e) => {
					error!("channel recvmsg failed: {e}");
					Err(())
				}
			}
		} else {
			match self.socket.recv_from(buf) {
				Ok((n, peer)) => Ok(Some((n, peer, None))),
				Err(e) if would_block(&e) => Ok(None),
				Err(e) => {
					error!("channel recv_from failed: {e}");
					Err(())
				}
			}
		}
	}

	/// Send one datagram to `peer`. If `info` is `Some`, the datagram's
	/// source address is pinned to `info.local_addr` via ancillary data;
	/// otherwise the kernel picks the source address as usual.
	pub fn send(&self, buf: &[u8], peer: SocketAddr, info: Option<PacketInfo>) -> Result<usize> {
		match info {
			Some(info) if self.wildcard_bound => match sys::sendmsg(&self.socket, buf, peer, info) {
				Ok(n) => Ok(n),
				Err(e) => {
					error!("channel sendmsg failed: {e}");
					Err(())
				}
			},
			Some(_) => {
				warn!("packet info supplied on a channel that is not wildcard-bound, ignoring");
				self.send_plain(buf, peer)
			}
			None => self.send_plain(buf, peer),
		}
	}

	fn send_plain(&self, buf: &[u8], peer: SocketAddr) -> Result<usize> {
		logged(self.socket.send_to(buf, peer), "channel send_to failed")
	}
}

fn would_block(e: &std::io::Error) -> bool {
	e.kind() == std::io::ErrorKind::WouldBlock
}

#[cfg(unix)]
mod sys {
	use std::io;
	use std::mem::{size_of, zeroed};
	use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
	use std::os::fd::AsRawFd;

	use super::{would_block, PacketInfo};

	/// Large enough for either an `in_pktinfo` or `in6_pktinfo` cmsg.
	const CMSG_BUF_LEN: usize = 256;

	pub fn enable_pktinfo(socket: &UdpSocket, is_v6: bool) -> super::Result<()> {
		let fd = socket.as_raw_fd();
		let on: libc::c_int = 1;

		let (level, name) = if is_v6 { (libc::IPPROTO_IPV6, libc::IPV6_RECVPKTINFO) } else { (libc::IPPROTO_IP, libc::IP_PKTINFO) };

		let rc = unsafe { libc::setsockopt(fd, level, name, &on as *const _ as *const libc::c_void, size_of::<libc::c_int>() as libc::socklen_t) };

		if rc != 0 {
			log::error!("failed to enable packet-info ancillary data: {}", io::Error::last_os_error());
			return Err(());
		}

		Ok(())
	}

	pub fn recvmsg(socket: &UdpSocket, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr, Option<PacketInfo>)>> {
		let fd = socket.as_raw_fd();

		let mut src: libc::sockaddr_storage = unsafe { zeroed() };
		let mut cmsg_buf = [0u8; CMSG_BUF_LEN];

		let mut iov = libc::iovec { iov_base: buf.as_mut_ptr() as *mut libc::c_void, iov_len: buf.len() };

		let mut msg: libc::msghdr = unsafe { zeroed() };
		msg.msg_name = &mut src as *mut _ as *mut libc::c_void;
		msg.msg_namelen = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
		msg.msg_iov = &mut iov;
		msg.msg_iovlen = 1;
		msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
		msg.msg_controllen = cmsg_buf.len() as _;

		let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };

		if n < 0 {
			let err = io::Error::last_os_error();
			return if would_block(&err) { Ok(None) } else { Err(err) };
		}

		let peer = sockaddr_to_std(&src)?;
		let info = unsafe { parse_pktinfo(&msg) };

		Ok(Some((n as usize, peer, info)))
	}

	pub fn sendmsg(socket: &UdpSocket, buf: &[u8], peer: SocketAddr, info: PacketInfo) -> io::Result<usize> {
		let fd = socket.as_raw_fd();

		let dst = std_to_sockaddr(peer);
		let mut cmsg_buf = [0u8; CMSG_BUF_LEN];

		let mut iov = libc::iovec { iov_base: buf.as_ptr() as *mut libc::c_void, iov_len: buf.len() };

		let mut msg: libc::msghdr = unsafe { zeroed() };
		msg.msg_name = &dst.storage as *const _ as *mut libc::c_void;
		msg.msg_namelen = dst.len;
		msg.msg_iov = &mut iov;
		msg.msg_iovlen = 1;

		let controllen = unsafe { fill_pktinfo(&mut msg, &mut cmsg_buf, info) };
		msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
		msg.msg_controllen = controllen as _;

		let n = unsafe { libc::sendmsg(fd, &msg, 0) };

		if n < 0 {
			Err(io::Error::last_os_error())
		} else {
			Ok(n as usize)
		}
	}

	unsafe fn parse_pktinfo(msg: &libc::msghdr) -> Option<PacketInfo> {
		let mut cmsg = libc::CMSG_FIRSTHDR(msg);

		while !cmsg.is_null() {
			let hdr = &*cmsg;

			if hdr.cmsg_level == libc::IPPROTO_IP && hdr.cmsg_type == libc::IP_PKTINFO {
				let data = libc::CMSG_DATA(cmsg) as *const libc::in_pktinfo;
				let info = &*data;
				return Some(PacketInfo { local_addr: IpAddr::V4(Ipv4Addr::from(u32::from_be(info.ipi_addr.s_addr))), if_index: info.ipi_ifindex as u32 });
			}

			if hdr.cmsg_level == libc::IPPROTO_IPV6 && hdr.cmsg_type == libc::IPV6_PKTINFO {
				let data = libc::CMSG_DATA(cmsg) as *const libc::in6_pktinfo;
				let info = &*data;
				return Some(PacketInfo { local_addr: IpAddr::V6(Ipv6Addr::from(info.ipi6_addr.s6_addr)), if_index: info.ipi6_ifindex });
			}

			cmsg = libc::CMSG_NXTHDR(msg, cmsg);
		}

		None
	}

	unsafe fn fill_pktinfo(msg: &mut libc::msghdr, buf: &mut [u8], info: PacketInfo) -> usize {
		msg.msg_control = buf.as_mut_ptr() as *mut libc::c_void;

		match info.local_addr {
			IpAddr::V4(addr) => {
				msg.msg_controllen = libc::CMSG_SPACE(size_of::<libc::in_pktinfo>() as u32) as _;
				let cmsg = libc::CMSG_FIRSTHDR(msg);
				(*cmsg).cmsg_level = libc::IPPROTO_IP;
				(*cmsg).cmsg_type = libc::IP_PKTINFO;
				(*cmsg).cmsg_len = libc::CMSG_LEN(size_of::<libc::in_pktinfo>() as u32) as _;

				let pktinfo = libc::in_pktinfo {
					ipi_ifindex: info.if_index as _,
					ipi_spec_dst: libc::in_addr { s_addr: 0 },
					ipi_addr: libc::in_addr { s_addr: u32::from(addr).to_be() },
				};

				std::ptr::write(libc::CMSG_DATA(cmsg) as *mut libc::in_pktinfo, pktinfo);
			}
			IpAddr::V6(addr) => {
				msg.msg_controllen = libc::CMSG_SPACE(size_of::<libc::in6_pktinfo>() as u32) as _;
				let cmsg = libc::CMSG_FIRSTHDR(msg);
				(*cmsg).cmsg_level = libc::IPPROTO_IPV6;
				(*cmsg).cmsg_type = libc::IPV6_PKTINFO;
				(*cmsg).cmsg_len = libc::CMSG_LEN(size_of::<libc::in6_pktinfo>() as u32) as _;

				let pktinfo = libc::in6_pktinfo { ipi6_ifindex: info.if_index, ipi6_addr: libc::in6_addr { s6_addr: addr.octets() } };

				std::ptr::write(libc::CMSG_DATA(cmsg) as *mut libc::in6_pktinfo, pktinfo);
			}
		}

		msg.msg_controllen as usize
	}

	struct RawSockaddr {
		storage: libc::sockaddr_storage,
		len: libc::socklen_t,
	}

	fn std_to_sockaddr(addr: SocketAddr) -> RawSockaddr {
		let mut storage: libc::sockaddr_storage = unsafe { zeroed() };

		let len = match addr {
			SocketAddr::V4(v4) => {
				let sin = libc::sockaddr_in {
					sin_family: libc::AF_INET as _,
					sin_port: v4.port().to_be(),
					sin_addr: libc::in_addr { s_addr: u32::from(*v4.ip()).to_be() },
					sin_zero: [0; 8],
				};
				unsafe { std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin) };
				size_of::<libc::sockaddr_in>()
			}
			SocketAddr::V6(v6) => {
				let sin6 = libc::sockaddr_in6 {
					sin6_family: libc::AF_INET6 as _,
					sin6_port: v6.port().to_be(),
					sin6_flowinfo: v6.flowinfo(),
					sin6_addr: libc::in6_addr { s6_addr: v6.ip().octets() },
					sin6_scope_id: v6.scope_id(),
				};
				unsafe { std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6) };
				size_of::<libc::sockaddr_in6>()
			}
		};

		RawSockaddr { storage, len: len as libc::socklen_t }
	}

	fn sockaddr_to_std(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
		match storage.ss_family as libc::c_int {
			libc::AF_INET => {
				let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
				let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
				Ok(SocketAddr::new(IpAddr::V4(ip), u16::from_be(sin.sin_port)))
			}
			libc::AF_INET6 => {
				let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
				let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
				Ok(SocketAddr::new(IpAddr::V6(ip), u16::from_be(sin6.sin6_port)))
			}
			family => Err(io::Error::new(io::ErrorKind::InvalidInput, format!("unsupported address family {family}"))),
		}
	}
}

#[cfg(not(unix))]
mod sys {
	use std::io;
	use std::net::{SocketAddr, UdpSocket};

	use super::PacketInfo;

	pub fn enable_pktinfo(_socket: &UdpSocket, _is_v6: bool) -> super::Result<()> {
		log::warn!("packet-info ancillary data is only implemented on unix; wildcard-bound source address recovery is disabled");
		Ok(())
	}

	pub fn recvmsg(_socket: &UdpSocket, _buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr, Option<PacketInfo>)>> {
		unreachable!("wildcard_bound is never set true on this platform")
	}

	pub fn sendmsg(_socket: &UdpSocket, _buf: &[u8], _peer: SocketAddr, _info: PacketInfo) -> io::Result<usize> {
		unreachable!("wildcard_bound is never set true on this platform")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn unicast_round_trip_without_pktinfo() {
		let a = Channel::bind("127.0.0.1:0".parse().unwrap()).unwrap();
		let b = Channel::bind("127.0.0.1:0".parse().unwrap()).unwrap();

		let a_addr = a.local_addr().unwrap();
		let b_addr = b.local_addr().unwrap();

		a.send(b"hello", b_addr, None).unwrap();

		std::thread::sleep(std::time::Duration::from_millis(20));

		let mut buf = [0u8; 64];
		let (n, peer, info) = b.recv(&mut buf).unwrap().expect("datagram pending");
		assert_eq!(&buf[..n], b"hello");
		assert_eq!(peer, a_addr);
		assert!(info.is_none());
	}

	#[test]
	fn recv_on_empty_socket_does_not_block() {
		let a = Channel::bind("127.0.0.1:0".parse().unwrap()).unwrap();
		let mut buf = [0u8; 64];
		assert!(a.recv(&mut buf).unwrap().is_none());
	}
}
