//! Transport capabilities the measurement actors are written against.
//!
//! A connection is split into three independently owned parts: a
//! [`UnitSink`] used by the sender, a [`UnitSource`] used by the receiver
//! and a [`StatsSource`] used by the measurer. Two real bindings exist
//! (message framed WebSocket, stream-per-message QUIC) plus an in-memory
//! binding for tests and embedding.

pub mod memory;
pub mod quic;
pub mod websocket;

use crate::error::{StatsError, TransportError};
use bytes::Bytes;
use ndt7_model::{ConnectionInfo, Measurement};
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

/// How long the read side stays open after the write side started closing.
pub const CLOSE_LINGER: Duration = Duration::from_secs(1);

/// One inbound unit of data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unit {
    /// A text message (or a stream that holds a JSON document).
    Text(String),
    /// Load traffic; only the size is kept.
    Binary(usize),
    /// A timing probe echoed back by the peer.
    Pong(Bytes),
}

/// Write half of a connection.
pub trait UnitSink: Send + 'static {
    /// Every later write fails with [`TransportError::Deadline`] once
    /// `deadline` has passed.
    fn set_write_deadline(&mut self, deadline: Instant) -> Result<(), TransportError>;

    /// Sends one self-contained text message.
    fn send_text(
        &mut self,
        text: String,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Sends one load message.
    fn send_load(
        &mut self,
        payload: Bytes,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Sends a timing probe the peer is expected to echo.
    fn send_probe(
        &mut self,
        payload: Bytes,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Graceful half-close: tells the peer no more data follows.
    fn close(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Read half of a connection.
pub trait UnitSource: Send + 'static {
    fn set_read_limit(&mut self, limit: usize);

    fn set_read_deadline(&mut self, deadline: Instant) -> Result<(), TransportError>;

    /// Next inbound unit; `Ok(None)` once the connection is closed.
    fn next_unit(
        &mut self,
    ) -> impl Future<Output = Result<Option<Unit>, TransportError>> + Send;
}

/// Best effort access to the connection statistics.
pub trait StatsSource: Send + 'static {
    /// Fails when the statistics cannot be read at all.
    fn prepare(&mut self) -> Result<(), StatsError>;

    /// Tries to switch the connection to BBR.
    fn enable_congestion_control(&mut self) -> Result<(), StatsError>;

    /// Fills the statistics blocks of `m`; blocks that are not available
    /// on this platform are left as `None`.
    fn sample(&mut self, elapsed: Duration, m: &mut Measurement);
}

/// A connection that can be split into its sink, source and statistics.
pub trait Transport: Send + 'static {
    type Sink: UnitSink;
    type Source: UnitSource;
    type Stats: StatsSource;

    /// Label used when reporting to the observer.
    fn protocol(&self) -> &'static str;

    fn connection_info(&self) -> &ConnectionInfo;

    /// Cancelling this token forcibly closes the connection: pending reads
    /// return `Ok(None)` and pending writes fail with
    /// [`TransportError::Closed`].
    fn close_handle(&self) -> CancellationToken;

    fn split(self) -> (Self::Sink, Self::Source, Self::Stats);
}

/// Half-close state shared by the sink and source of one connection.
#[derive(Debug, Clone, Default)]
pub(crate) struct Closing {
    token: CancellationToken,
    at: Arc<OnceLock<Instant>>,
}

impl Closing {
    pub(crate) fn start(&self) {
        let _ = self.at.set(Instant::now());
        self.token.cancel();
    }

    /// Resolves `linger` after [`Closing::start`] was first called.
    pub(crate) async fn expired(&self, linger: Duration) {
        self.token.cancelled().await;
        let at = self.at.get().copied().unwrap_or_else(Instant::now);
        sleep_until(at + linger).await;
    }
}

/// Runs `fut` until `deadline`, or until `closed` is cancelled.
pub(crate) async fn bounded<F, T, E>(
    deadline: Option<Instant>,
    closed: &CancellationToken,
    fut: F,
) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<TransportError>,
{
    let deadline_hit = async {
        match deadline {
            Some(d) => sleep_until(d).await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        res = fut => res.map_err(Into::into),
        _ = deadline_hit => Err(TransportError::Deadline),
        _ = closed.cancelled() => Err(TransportError::Closed),
    }
}
