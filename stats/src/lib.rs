//! Rate estimation shared by the sender (input bitrate, for the
//! bandwidth field reported in ACKs) and the receiver (packet-arrival
//! rate, used to size buffers and judge whether the peer is keeping up).

mod arrival;
mod bitrate;
mod jitter;

pub use arrival::ArrivalRateFilter;
pub use bitrate::BitrateEstimator;
pub use jitter::{JitterEstimator, JitterTracer};
