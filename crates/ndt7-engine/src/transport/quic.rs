//! Stream-per-message binding over a QUIC connection.
//!
//! Every message travels on its own unidirectional stream, so the stream
//! boundary is the message boundary. Timing probes use datagrams when the
//! peer negotiated them.

use super::{CLOSE_LINGER, Closing, Transport, Unit, UnitSink, UnitSource, bounded};
use crate::error::TransportError;
use crate::stats::QuicStats;
use bytes::Bytes;
use ndt7_model::protocol::{ALPN_DOWNLOAD, ALPN_UPLOAD};
use ndt7_model::{ConnectionInfo, SessionBounds, SubtestKind};
use quinn::crypto::rustls::{HandshakeData, QuicServerConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

const READ_CHUNK: usize = 64 * 1024;

/// Server configuration offering both subtest ALPNs, with BBR congestion
/// control and datagrams enabled.
pub fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<quinn::ServerConfig, TransportError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut tls = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    tls.alpn_protocols = vec![ALPN_DOWNLOAD.to_vec(), ALPN_UPLOAD.to_vec()];

    let mut transport = quinn::TransportConfig::default();
    transport.congestion_controller_factory(Arc::new(quinn::congestion::BbrConfig::default()));
    transport.datagram_receive_buffer_size(Some(1 << 16));

    let mut config = quinn::ServerConfig::with_crypto(Arc::new(QuicServerConfig::try_from(tls)?));
    config.transport_config(Arc::new(transport));
    Ok(config)
}

/// Subtest chosen by the client through ALPN.
pub fn negotiated_subtest(conn: &quinn::Connection) -> Option<SubtestKind> {
    let data = conn.handshake_data()?.downcast::<HandshakeData>().ok()?;
    data.protocol.as_deref().and_then(SubtestKind::from_alpn)
}

pub struct QuicTransport {
    conn: quinn::Connection,
    info: ConnectionInfo,
    bbr: bool,
    accept_timeout: Duration,
    closed: CancellationToken,
}

impl QuicTransport {
    /// `bbr` tells whether the endpoint was built with BBR. Each wait for
    /// the next client stream is capped by `bounds.accept_timeout`.
    pub fn new(
        conn: quinn::Connection,
        local: SocketAddr,
        uuid: String,
        bounds: &SessionBounds,
        bbr: bool,
    ) -> Self {
        let info = ConnectionInfo {
            client: conn.remote_address().to_string(),
            server: local.to_string(),
            uuid,
        };
        Self {
            conn,
            info,
            bbr,
            accept_timeout: bounds.accept_timeout,
            closed: CancellationToken::new(),
        }
    }
}

impl Transport for QuicTransport {
    type Sink = QuicSink;
    type Source = QuicSource;
    type Stats = QuicStats;

    fn protocol(&self) -> &'static str {
        "ndt7+quic"
    }

    fn connection_info(&self) -> &ConnectionInfo {
        &self.info
    }

    fn close_handle(&self) -> CancellationToken {
        self.closed.clone()
    }

    fn split(self) -> (QuicSink, QuicSource, QuicStats) {
        let closing = Closing::default();
        let stream_bytes = Arc::new(AtomicU64::new(0));
        (
            QuicSink {
                conn: self.conn.clone(),
                deadline: None,
                closed: self.closed.clone(),
                closing: closing.clone(),
                last: None,
            },
            QuicSource {
                conn: self.conn.clone(),
                limit: usize::MAX,
                deadline: None,
                accept_timeout: self.accept_timeout,
                closed: self.closed,
                closing,
                stream_bytes: stream_bytes.clone(),
            },
            QuicStats::new(self.conn, stream_bytes, self.bbr),
        )
    }
}

pub struct QuicSink {
    conn: quinn::Connection,
    deadline: Option<Instant>,
    closed: CancellationToken,
    closing: Closing,
    last: Option<quinn::SendStream>,
}

impl QuicSink {
    async fn write_stream(&mut self, payload: Bytes) -> Result<(), TransportError> {
        let conn = self.conn.clone();
        let write = async move {
            let mut stream = conn.open_uni().await?;
            stream.write_chunk(payload).await?;
            stream.finish()?;
            Ok::<_, TransportError>(stream)
        };
        let stream = bounded(self.deadline, &self.closed, write).await?;
        self.last = Some(stream);
        Ok(())
    }

    fn check_deadline(&self) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(TransportError::Deadline);
        }
        Ok(())
    }
}

impl UnitSink for QuicSink {
    fn set_write_deadline(&mut self, deadline: Instant) -> Result<(), TransportError> {
        if let Some(reason) = self.conn.close_reason() {
            return Err(reason.into());
        }
        self.deadline = Some(deadline);
        Ok(())
    }

    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.write_stream(Bytes::from(text)).await
    }

    async fn send_load(&mut self, payload: Bytes) -> Result<(), TransportError> {
        self.write_stream(payload).await
    }

    async fn send_probe(&mut self, payload: Bytes) -> Result<(), TransportError> {
        self.check_deadline()?;
        if self.conn.max_datagram_size().is_none() {
            return Ok(());
        }
        self.conn.send_datagram(payload)?;
        Ok(())
    }

    /// Waits until the last stream is acknowledged; the connection itself
    /// stays open so the client can finish its reports.
    async fn close(&mut self) -> Result<(), TransportError> {
        self.closing.start();
        let Some(last) = self.last.take() else {
            return Ok(());
        };
        match bounded(self.deadline, &self.closed, last.stopped()).await {
            Ok(_) | Err(TransportError::Deadline) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

enum Inbound {
    Stream(quinn::RecvStream),
    Datagram(Bytes),
}

pub struct QuicSource {
    conn: quinn::Connection,
    limit: usize,
    deadline: Option<Instant>,
    accept_timeout: Duration,
    closed: CancellationToken,
    closing: Closing,
    stream_bytes: Arc<AtomicU64>,
}

fn is_closed(e: &quinn::ConnectionError) -> bool {
    matches!(
        e,
        quinn::ConnectionError::ApplicationClosed(_)
            | quinn::ConnectionError::ConnectionClosed(_)
            | quinn::ConnectionError::LocallyClosed
    )
}

/// Accumulates one inbound stream and classifies it as it arrives.
///
/// Bytes are kept only while the stream may still be a JSON report: it
/// must start with `{` (after whitespace) and fit the read limit.
#[derive(Debug)]
struct StreamBody {
    limit: usize,
    buf: Vec<u8>,
    total: usize,
    maybe_text: bool,
}

impl StreamBody {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            buf: Vec::new(),
            total: 0,
            maybe_text: true,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        self.total += chunk.len();
        if !self.maybe_text {
            return;
        }
        if self.total > self.limit {
            self.discard();
            return;
        }
        self.buf.extend_from_slice(chunk);
        if let Some(&first) = self.buf.trim_ascii_start().first() {
            if first != b'{' {
                self.discard();
            }
        }
    }

    fn discard(&mut self) {
        self.maybe_text = false;
        self.buf = Vec::new();
    }

    fn finish(self) -> Unit {
        if self.maybe_text && !self.buf.is_empty() {
            if let Ok(text) = String::from_utf8(self.buf) {
                return Unit::Text(text);
            }
        }
        Unit::Binary(self.total)
    }
}

impl QuicSource {
    /// Reads a whole stream. Gives up with `None` once the write side has
    /// been closing for longer than the linger.
    async fn read_stream(&self, mut recv: quinn::RecvStream) -> Result<Option<Unit>, TransportError> {
        let mut body = StreamBody::new(self.limit);
        let read = async {
            while let Some(chunk) = recv.read_chunk(READ_CHUNK, true).await? {
                self.stream_bytes
                    .fetch_add(chunk.bytes.len() as u64, Ordering::Relaxed);
                body.push(&chunk.bytes);
            }
            Ok::<_, TransportError>(())
        };
        tokio::select! {
            res = bounded(self.deadline, &self.closed, read) => res?,
            _ = self.closing.expired(CLOSE_LINGER) => return Ok(None),
        }
        Ok(Some(body.finish()))
    }
}

impl UnitSource for QuicSource {
    fn set_read_limit(&mut self, limit: usize) {
        self.limit = limit;
    }

    fn set_read_deadline(&mut self, deadline: Instant) -> Result<(), TransportError> {
        if let Some(reason) = self.conn.close_reason() {
            return Err(reason.into());
        }
        self.deadline = Some(deadline);
        Ok(())
    }

    async fn next_unit(&mut self) -> Result<Option<Unit>, TransportError> {
        let deadline = self.deadline;
        let inbound = tokio::select! {
            _ = self.closed.cancelled() => {
                self.conn.close(0u32.into(), b"closed");
                return Ok(None);
            }
            _ = self.closing.expired(CLOSE_LINGER) => return Ok(None),
            _ = async {
                match deadline {
                    Some(d) => sleep_until(d).await,
                    None => std::future::pending().await,
                }
            } => return Err(TransportError::Deadline),
            accepted = tokio::time::timeout(self.accept_timeout, self.conn.accept_uni()) => {
                match accepted {
                    Err(_) => return Err(TransportError::AcceptTimeout(self.accept_timeout)),
                    Ok(Err(e)) if is_closed(&e) => return Ok(None),
                    Ok(Err(e)) => return Err(e.into()),
                    Ok(Ok(recv)) => Inbound::Stream(recv),
                }
            }
            datagram = self.conn.read_datagram() => {
                match datagram {
                    Ok(payload) => Inbound::Datagram(payload),
                    Err(e) if is_closed(&e) => return Ok(None),
                    Err(e) => return Err(e.into()),
                }
            }
        };
        match inbound {
            Inbound::Datagram(payload) => Ok(Some(Unit::Pong(payload))),
            Inbound::Stream(recv) => self.read_stream(recv).await,
        }
    }
}
