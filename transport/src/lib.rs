pub mod connection;
pub mod cookie;
pub mod handshake;
pub mod rtt;
pub mod state;
pub mod timers;

pub use connection::{resolve_km, AckReport, Connection, Role};
pub use rtt::RttEstimator;
pub use state::{ConnState, KmState, RejectReason};
pub use timers::{ExpTimer, KeepaliveTimer};
