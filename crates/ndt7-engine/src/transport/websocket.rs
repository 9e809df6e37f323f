//! Message framed binding over a WebSocket connection.

use super::{CLOSE_LINGER, Closing, Transport, Unit, UnitSink, UnitSource, bounded};
use crate::error::TransportError;
use crate::stats::TcpStats;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use ndt7_model::ConnectionInfo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{Instant, sleep_until};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message, Utf8Bytes};
use tokio_util::sync::CancellationToken;

pub struct WebSocketTransport<S> {
    ws: WebSocketStream<S>,
    conn: ConnectionInfo,
    stats: TcpStats,
    closed: CancellationToken,
}

impl<S> WebSocketTransport<S> {
    pub fn new(ws: WebSocketStream<S>, conn: ConnectionInfo, stats: TcpStats) -> Self {
        Self {
            ws,
            conn,
            stats,
            closed: CancellationToken::new(),
        }
    }
}

impl WebSocketTransport<TcpStream> {
    /// Wraps an upgraded plain TCP connection; kernel statistics come from
    /// a duplicate of its descriptor.
    pub fn from_tcp(ws: WebSocketStream<TcpStream>, uuid: String) -> std::io::Result<Self> {
        let tcp = ws.get_ref();
        let conn = ConnectionInfo {
            client: tcp.peer_addr()?.to_string(),
            server: tcp.local_addr()?.to_string(),
            uuid,
        };
        let stats = TcpStats::from_tcp(tcp);
        Ok(Self::new(ws, conn, stats))
    }
}

impl<S> Transport for WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Sink = WsSink<S>;
    type Source = WsSource<S>;
    type Stats = TcpStats;

    fn protocol(&self) -> &'static str {
        "ndt7+ws"
    }

    fn connection_info(&self) -> &ConnectionInfo {
        &self.conn
    }

    fn close_handle(&self) -> CancellationToken {
        self.closed.clone()
    }

    fn split(self) -> (WsSink<S>, WsSource<S>, TcpStats) {
        let (sink, stream) = self.ws.split();
        let closing = Closing::default();
        (
            WsSink {
                inner: sink,
                deadline: None,
                closed: self.closed.clone(),
                closing: closing.clone(),
            },
            WsSource {
                inner: stream,
                limit: usize::MAX,
                deadline: None,
                closed: self.closed,
                closing,
            },
            self.stats,
        )
    }
}

pub struct WsSink<S> {
    inner: SplitSink<WebSocketStream<S>, Message>,
    deadline: Option<Instant>,
    closed: CancellationToken,
    closing: Closing,
}

impl<S> WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn write(&mut self, msg: Message) -> Result<(), TransportError> {
        bounded(self.deadline, &self.closed, self.inner.send(msg)).await
    }
}

impl<S> UnitSink for WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn set_write_deadline(&mut self, deadline: Instant) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.deadline = Some(deadline);
        Ok(())
    }

    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.write(Message::Text(text.into())).await
    }

    async fn send_load(&mut self, payload: Bytes) -> Result<(), TransportError> {
        self.write(Message::Binary(payload)).await
    }

    async fn send_probe(&mut self, payload: Bytes) -> Result<(), TransportError> {
        self.write(Message::Ping(payload)).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closing.start();
        self.write(Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: Utf8Bytes::from_static("Done sending"),
        })))
        .await
    }
}

pub struct WsSource<S> {
    inner: SplitStream<WebSocketStream<S>>,
    limit: usize,
    deadline: Option<Instant>,
    closed: CancellationToken,
    closing: Closing,
}

impl<S> WsSource<S> {
    fn check_size(&self, size: usize) -> Result<(), TransportError> {
        if size > self.limit {
            return Err(TransportError::TooLarge {
                size,
                limit: self.limit,
            });
        }
        Ok(())
    }
}

impl<S> UnitSource for WsSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn set_read_limit(&mut self, limit: usize) {
        self.limit = limit;
    }

    fn set_read_deadline(&mut self, deadline: Instant) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.deadline = Some(deadline);
        Ok(())
    }

    async fn next_unit(&mut self) -> Result<Option<Unit>, TransportError> {
        let deadline = self.deadline;
        loop {
            let msg = tokio::select! {
                _ = self.closed.cancelled() => return Ok(None),
                _ = self.closing.expired(CLOSE_LINGER) => return Ok(None),
                _ = async {
                    match deadline {
                        Some(d) => sleep_until(d).await,
                        None => std::future::pending().await,
                    }
                } => return Err(TransportError::Deadline),
                msg = self.inner.next() => msg,
            };
            let msg = match msg {
                None => return Ok(None),
                Some(Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed)) => {
                    return Ok(None);
                }
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(msg)) => msg,
            };
            match msg {
                Message::Text(text) => {
                    self.check_size(text.len())?;
                    return Ok(Some(Unit::Text(text.as_str().to_owned())));
                }
                Message::Binary(payload) => {
                    self.check_size(payload.len())?;
                    return Ok(Some(Unit::Binary(payload.len())));
                }
                Message::Pong(payload) => return Ok(Some(Unit::Pong(payload))),
                Message::Close(_) => return Ok(None),
                // Pings are answered by the protocol layer.
                Message::Ping(_) | Message::Frame(_) => continue,
            }
        }
    }
}
