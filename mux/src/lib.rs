pub mod demux;
pub mod epoll;
pub mod multiplexer;

pub use demux::{DemuxTable, LISTENER_SOCKET_ID};
pub use epoll::{Epoll, Events, SocketId};
pub use multiplexer::Multiplexer;
