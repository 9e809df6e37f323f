use serde::{Deserialize, Serialize};
use std::fmt;

/// WebSocket subprotocol a client must request.
pub const SEC_WEBSOCKET_PROTOCOL: &str = "net.measurementlab.ndt.v7";

pub const DOWNLOAD_URL_PATH: &str = "/ndt/v7/download";
pub const UPLOAD_URL_PATH: &str = "/ndt/v7/upload";

/// ALPN identifiers used to pick the subtest of a QUIC connection.
pub const ALPN_DOWNLOAD: &[u8] = b"ndt7-download";
pub const ALPN_UPLOAD: &[u8] = b"ndt7-upload";

pub const DEFAULT_WEBSOCKET_BUFFER_SIZE: usize = 1 << 20;

/// Initial size of a download load message.
pub const MIN_MESSAGE_SIZE: usize = 1 << 10;

/// Download load messages never grow past this size.
pub const MAX_SCALED_MESSAGE_SIZE: usize = 1 << 20;

/// A load message doubles only while it is smaller than
/// `total_bytes_sent / SCALING_FRACTION`.
pub const SCALING_FRACTION: usize = 16;

/// Direction of a subtest, as seen from the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubtestKind {
    Download,
    Upload,
}

impl SubtestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubtestKind::Download => "download",
            SubtestKind::Upload => "upload",
        }
    }

    pub fn from_path(path: &str) -> Option<Self> {
        match path {
            DOWNLOAD_URL_PATH => Some(SubtestKind::Download),
            UPLOAD_URL_PATH => Some(SubtestKind::Upload),
            _ => None,
        }
    }

    pub fn from_alpn(proto: &[u8]) -> Option<Self> {
        match proto {
            ALPN_DOWNLOAD => Some(SubtestKind::Download),
            ALPN_UPLOAD => Some(SubtestKind::Upload),
            _ => None,
        }
    }
}

impl fmt::Display for SubtestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
