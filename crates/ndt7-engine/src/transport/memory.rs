//! In-process transport: two channels standing in for a connection.
//!
//! The server half implements [`Transport`]; the [`MemoryPeer`] half plays
//! the client. Byte counters feed a synthetic `TCPInfo` so rates can be
//! computed exactly as with a kernel socket.

use super::{CLOSE_LINGER, Closing, StatsSource, Transport, Unit, UnitSink, UnitSource};
use crate::error::{StatsError, TransportError};
use bytes::Bytes;
use ndt7_model::{ConnectionInfo, Measurement, TcpInfo};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

/// A unit of data crossing the in-memory connection, in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(usize),
    Ping(Bytes),
    Pong(Bytes),
    Close,
    /// Delivered to the server as a read error.
    Error(String),
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
}

pub struct MemoryTransport {
    conn: ConnectionInfo,
    to_peer: mpsc::UnboundedSender<Frame>,
    from_peer: mpsc::UnboundedReceiver<Frame>,
    closed: CancellationToken,
    counters: Arc<Counters>,
    stats_available: bool,
}

/// Client side of an in-memory connection.
pub struct MemoryPeer {
    pub outbound: mpsc::UnboundedSender<Frame>,
    pub inbound: mpsc::UnboundedReceiver<Frame>,
}

/// Creates a connected server/client pair.
pub fn pair(conn: ConnectionInfo) -> (MemoryTransport, MemoryPeer) {
    let (to_peer, inbound) = mpsc::unbounded_channel();
    let (outbound, from_peer) = mpsc::unbounded_channel();
    (
        MemoryTransport {
            conn,
            to_peer,
            from_peer,
            closed: CancellationToken::new(),
            counters: Arc::default(),
            stats_available: true,
        },
        MemoryPeer { outbound, inbound },
    )
}

impl MemoryTransport {
    /// Makes the statistics source fail to initialize.
    pub fn without_stats(mut self) -> Self {
        self.stats_available = false;
        self
    }
}

impl Transport for MemoryTransport {
    type Sink = MemorySink;
    type Source = MemorySource;
    type Stats = MemoryStats;

    fn protocol(&self) -> &'static str {
        "memory"
    }

    fn connection_info(&self) -> &ConnectionInfo {
        &self.conn
    }

    fn close_handle(&self) -> CancellationToken {
        self.closed.clone()
    }

    fn split(self) -> (MemorySink, MemorySource, MemoryStats) {
        let closing = Closing::default();
        (
            MemorySink {
                tx: self.to_peer,
                deadline: None,
                closed: self.closed.clone(),
                closing: closing.clone(),
                counters: self.counters.clone(),
            },
            MemorySource {
                rx: self.from_peer,
                limit: usize::MAX,
                deadline: None,
                closed: self.closed,
                closing,
                counters: self.counters.clone(),
            },
            MemoryStats {
                counters: self.counters,
                available: self.stats_available,
            },
        )
    }
}

pub struct MemorySink {
    tx: mpsc::UnboundedSender<Frame>,
    deadline: Option<Instant>,
    closed: CancellationToken,
    closing: Closing,
    counters: Arc<Counters>,
}

impl MemorySink {
    fn push(&mut self, frame: Frame, payload: usize) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(TransportError::Deadline);
        }
        self.tx.send(frame).map_err(|_| TransportError::Closed)?;
        self.counters
            .sent
            .fetch_add(payload as u64, Ordering::Relaxed);
        Ok(())
    }
}

impl UnitSink for MemorySink {
    fn set_write_deadline(&mut self, deadline: Instant) -> Result<(), TransportError> {
        self.deadline = Some(deadline);
        Ok(())
    }

    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        let len = text.len();
        self.push(Frame::Text(text), len)
    }

    async fn send_load(&mut self, payload: Bytes) -> Result<(), TransportError> {
        let len = payload.len();
        self.push(Frame::Binary(len), len)?;
        // Lets the peer and the timers run between load messages.
        tokio::task::yield_now().await;
        Ok(())
    }

    async fn send_probe(&mut self, payload: Bytes) -> Result<(), TransportError> {
        self.push(Frame::Ping(payload), 0)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closing.start();
        self.push(Frame::Close, 0)
    }
}

pub struct MemorySource {
    rx: mpsc::UnboundedReceiver<Frame>,
    limit: usize,
    deadline: Option<Instant>,
    closed: CancellationToken,
    closing: Closing,
    counters: Arc<Counters>,
}

impl MemorySource {
    fn check_size(&self, size: usize) -> Result<(), TransportError> {
        if size > self.limit {
            return Err(TransportError::TooLarge {
                size,
                limit: self.limit,
            });
        }
        self.counters
            .received
            .fetch_add(size as u64, Ordering::Relaxed);
        Ok(())
    }
}

impl UnitSource for MemorySource {
    fn set_read_limit(&mut self, limit: usize) {
        self.limit = limit;
    }

    fn set_read_deadline(&mut self, deadline: Instant) -> Result<(), TransportError> {
        self.deadline = Some(deadline);
        Ok(())
    }

    async fn next_unit(&mut self) -> Result<Option<Unit>, TransportError> {
        let deadline = self.deadline;
        loop {
            let frame = tokio::select! {
                _ = self.closed.cancelled() => return Ok(None),
                _ = self.closing.expired(CLOSE_LINGER) => return Ok(None),
                _ = async {
                    match deadline {
                        Some(d) => sleep_until(d).await,
                        None => std::future::pending().await,
                    }
                } => return Err(TransportError::Deadline),
                frame = self.rx.recv() => frame,
            };
            match frame {
                None | Some(Frame::Close) => return Ok(None),
                Some(Frame::Text(text)) => {
                    self.check_size(text.len())?;
                    return Ok(Some(Unit::Text(text)));
                }
                Some(Frame::Binary(size)) => {
                    self.check_size(size)?;
                    return Ok(Some(Unit::Binary(size)));
                }
                Some(Frame::Pong(payload)) => return Ok(Some(Unit::Pong(payload))),
                Some(Frame::Ping(_)) => continue,
                Some(Frame::Error(msg)) => {
                    return Err(TransportError::Io(std::io::Error::other(msg)));
                }
            }
        }
    }
}

pub struct MemoryStats {
    counters: Arc<Counters>,
    available: bool,
}

impl StatsSource for MemoryStats {
    fn prepare(&mut self) -> Result<(), StatsError> {
        if self.available {
            Ok(())
        } else {
            Err(StatsError::Unsupported)
        }
    }

    fn enable_congestion_control(&mut self) -> Result<(), StatsError> {
        Err(StatsError::Unsupported)
    }

    fn sample(&mut self, elapsed: Duration, m: &mut Measurement) {
        m.tcp_info = Some(TcpInfo {
            bytes_acked: self.counters.sent.load(Ordering::Relaxed) as i64,
            bytes_received: self.counters.received.load(Ordering::Relaxed) as i64,
            elapsed_time: elapsed.as_micros() as i64,
            ..Default::default()
        });
    }
}

impl MemoryPeer {
    pub fn send(&self, frame: Frame) -> bool {
        self.outbound.send(frame).is_ok()
    }

    pub async fn recv(&mut self) -> Option<Frame> {
        self.inbound.recv().await
    }

    /// Plays a well-behaved download client: echoes probes as pongs and
    /// returns every text message received until the server closes.
    pub async fn echo_until_close(mut self) -> Vec<String> {
        let mut texts = Vec::new();
        while let Some(frame) = self.inbound.recv().await {
            match frame {
                Frame::Ping(payload) => {
                    let _ = self.outbound.send(Frame::Pong(payload));
                }
                Frame::Text(text) => texts.push(text),
                Frame::Close => break,
                _ => {}
            }
        }
        texts
    }
}
