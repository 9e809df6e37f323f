use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("deadline exceeded")]
    Deadline,
    #[error("no stream accepted within {0:?}")]
    AcceptTimeout(std::time::Duration),
    #[error("message of {size} bytes exceeds the {limit} bytes limit")]
    TooLarge { size: usize, limit: usize },
    #[error("connection closed")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("quic connection error: {0}")]
    QuicConnection(#[from] quinn::ConnectionError),
    #[error("quic write error: {0}")]
    QuicWrite(#[from] quinn::WriteError),
    #[error("quic read error: {0}")]
    QuicRead(#[from] quinn::ReadError),
    #[error("quic stream already closed")]
    QuicClosedStream(#[from] quinn::ClosedStream),
    #[error("quic datagram error: {0}")]
    QuicDatagram(#[from] quinn::SendDatagramError),
    #[error("quic stream stopped: {0}")]
    QuicStopped(#[from] quinn::StoppedError),
    #[error("tls configuration error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("tls configuration has no initial cipher suite")]
    NoInitialCipherSuite(#[from] quinn::crypto::rustls::NoInitialCipherSuite),
}

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("connection statistics are not supported on this platform")]
    Unsupported,
    #[error("{op} failed: {source}")]
    Syscall {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Other(String),
}

/// Terminal error of the sender; the only error a subtest reports.
#[derive(Debug, Error)]
pub enum SenderError {
    #[error("cannot set write deadline: {0}")]
    SetWriteDeadline(#[source] TransportError),
    #[error("cannot encode measurement: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("cannot write measurement: {0}")]
    WriteMeasurement(#[source] TransportError),
    #[error("cannot write load message: {0}")]
    WriteLoad(#[source] TransportError),
    #[error("cannot send timing probe: {0}")]
    Probe(#[source] TransportError),
}

impl SenderError {
    /// Stable label used for error counters.
    pub fn label(&self) -> &'static str {
        match self {
            SenderError::SetWriteDeadline(_) => "set-write-deadline",
            SenderError::Encode(_) => "marshal-measurement",
            SenderError::WriteMeasurement(_) => "write-json",
            SenderError::WriteLoad(_) => "write-prepared-message",
            SenderError::Probe(_) => "ping-send-ticks",
        }
    }
}

/// Why a receiver stopped early. Absorbed, never returned by a subtest.
#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error("cannot set read deadline: {0}")]
    SetReadDeadline(#[source] TransportError),
    #[error("cannot read message: {0}")]
    Read(#[source] TransportError),
    #[error("non-text message during download")]
    WrongMessageType,
    #[error("cannot decode client message: {0}")]
    Unmarshal(#[from] serde_json::Error),
    #[error("cannot parse echoed probe: {0}")]
    PingParse(#[source] serde_json::Error),
}

impl ReceiveError {
    pub fn label(&self) -> &'static str {
        match self {
            ReceiveError::SetReadDeadline(_) => "set-read-deadline",
            ReceiveError::Read(_) => "read-message",
            ReceiveError::WrongMessageType => "wrong-message-type",
            ReceiveError::Unmarshal(_) => "unmarshal-client-message",
            ReceiveError::PingParse(_) => "ping-parse-ticks",
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connection has no session identifier")]
    MissingUuid,
    #[error("invalid session bounds: {0}")]
    Config(#[from] ndt7_model::ConfigError),
}

#[derive(Debug, Error)]
pub enum ResultError {
    #[error("cannot create {path}: {source}")]
    Create {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot encode result: {0}")]
    Encode(#[from] serde_json::Error),
}
