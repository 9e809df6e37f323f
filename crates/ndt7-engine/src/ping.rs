//! Application level timing probes.
//!
//! A probe carries the number of nanoseconds elapsed since the start of the
//! subtest, JSON encoded. The peer echoes it unchanged and the receiver
//! derives the round trip time from the difference.

use bytes::Bytes;
use std::time::Duration;
use tokio::time::Instant;

/// Monotonic tick source shared by the sender and the receiver of a subtest.
#[derive(Debug, Clone, Copy)]
pub struct TickClock {
    base: Instant,
}

impl TickClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
        }
    }

    pub fn ticks(&self) -> i64 {
        i64::try_from(self.base.elapsed().as_nanos()).unwrap_or(i64::MAX)
    }

    /// Payload of a probe sent now.
    pub fn probe(&self) -> Bytes {
        Bytes::from(self.ticks().to_string())
    }

    /// Round trip time of an echoed probe.
    pub fn parse_echo(&self, payload: &[u8]) -> Result<Duration, serde_json::Error> {
        let sent: i64 = serde_json::from_slice(payload)?;
        let rtt = self.ticks().saturating_sub(sent).max(0);
        Ok(Duration::from_nanos(rtt as u64))
    }
}

impl Default for TickClock {
    fn default() -> Self {
        Self::new()
    }
}
