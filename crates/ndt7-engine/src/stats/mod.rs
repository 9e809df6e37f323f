//! Connection statistics sources used by the measurer.

mod quic;
mod tcp;

pub use quic::QuicStats;
pub use tcp::TcpStats;
