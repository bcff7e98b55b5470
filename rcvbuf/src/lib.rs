//! The receive buffer: a fixed-capacity cylinder of cells indexed modulo
//! its capacity, the receiver loss list (with its fresh-loss secondary
//! list), and the TSBPD time base that turns a packet's wire timestamp
//! into a local play time.

mod buffer;
mod cell;
mod loss;
pub mod tsbpd;

pub use buffer::{FirstValidPacketInfo, InsertOutcome, ReadMessage, ReceiveBuffer};
pub use cell::{Cell, CellState};
pub use loss::{LossEntry, ReceiverLossList};
pub use tsbpd::TimeBase;
