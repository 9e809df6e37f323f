use crate::error::StatsError;
use crate::transport::StatsSource;
use ndt7_model::{Measurement, QuicInfo};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Statistics of a QUIC connection, read from the library's counters.
///
/// The congestion controller is picked when the endpoint is built, so
/// [`StatsSource::enable_congestion_control`] only reports that choice.
pub struct QuicStats {
    conn: quinn::Connection,
    stream_bytes: Arc<AtomicU64>,
    bbr: bool,
}

impl QuicStats {
    pub fn new(conn: quinn::Connection, stream_bytes: Arc<AtomicU64>, bbr: bool) -> Self {
        Self {
            conn,
            stream_bytes,
            bbr,
        }
    }
}

impl StatsSource for QuicStats {
    fn prepare(&mut self) -> Result<(), StatsError> {
        Ok(())
    }

    fn enable_congestion_control(&mut self) -> Result<(), StatsError> {
        if self.bbr {
            Ok(())
        } else {
            Err(StatsError::Other(
                "endpoint not configured with bbr".to_string(),
            ))
        }
    }

    fn sample(&mut self, elapsed: Duration, m: &mut Measurement) {
        let stats = self.conn.stats();
        m.quic_info = Some(QuicInfo {
            elapsed_time: elapsed.as_micros() as i64,
            stream_bytes_received: self.stream_bytes.load(Ordering::Relaxed) as i64,
            bytes_sent: stats.udp_tx.bytes as i64,
            bytes_received: stats.udp_rx.bytes as i64,
            smoothed_rtt: stats.path.rtt.as_micros() as i64,
            cwnd: stats.path.cwnd as i64,
            lost_packets: stats.path.lost_packets as i64,
            congestion_events: stats.path.congestion_events as i64,
        });
    }
}
