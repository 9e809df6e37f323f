use crate::protocol::SubtestKind;
use serde::{Deserialize, Serialize};

/// Which side of the connection produced a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Client,
    Server,
}

/// Application level counters, as reported by clients.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AppInfo {
    pub elapsed_time: i64,
    pub num_bytes: i64,
}

/// Addresses and session identifier attached to every server sample.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConnectionInfo {
    pub client: String,
    pub server: String,
    #[serde(rename = "UUID")]
    pub uuid: String,
}

/// BBR congestion control state (Linux `TCP_CC_INFO`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BbrInfo {
    /// Bottleneck bandwidth estimate, bytes per second.
    #[serde(rename = "BW")]
    pub bw: i64,
    /// Minimum RTT, microseconds.
    #[serde(rename = "MinRTT")]
    pub min_rtt: u32,
    #[serde(rename = "PacingGain")]
    pub pacing_gain: u32,
    #[serde(rename = "CwndGain")]
    pub cwnd_gain: u32,
    #[serde(rename = "ElapsedTime")]
    pub elapsed_time: i64,
}

/// Snapshot of the kernel `tcp_info` structure.
///
/// Times are in microseconds unless the kernel reports them in
/// milliseconds (`LastDataSent` and friends).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TcpInfo {
    pub state: u8,
    #[serde(rename = "CAState")]
    pub ca_state: u8,
    pub retransmits: u8,
    pub probes: u8,
    pub backoff: u8,
    pub options: u8,
    #[serde(rename = "WScale")]
    pub wscale: u8,
    pub app_limited: u8,
    #[serde(rename = "RTO")]
    pub rto: u32,
    #[serde(rename = "ATO")]
    pub ato: u32,
    #[serde(rename = "SndMSS")]
    pub snd_mss: u32,
    #[serde(rename = "RcvMSS")]
    pub rcv_mss: u32,
    pub unacked: u32,
    pub sacked: u32,
    pub lost: u32,
    pub retrans: u32,
    pub last_data_sent: u32,
    pub last_ack_sent: u32,
    pub last_data_recv: u32,
    pub last_ack_recv: u32,
    #[serde(rename = "PMTU")]
    pub pmtu: u32,
    pub rcv_ss_thresh: u32,
    #[serde(rename = "RTT")]
    pub rtt: u32,
    #[serde(rename = "RTTVar")]
    pub rtt_var: u32,
    pub snd_ss_thresh: u32,
    pub snd_cwnd: u32,
    #[serde(rename = "AdvMSS")]
    pub adv_mss: u32,
    pub reordering: u32,
    #[serde(rename = "RcvRTT")]
    pub rcv_rtt: u32,
    pub rcv_space: u32,
    pub total_retrans: u32,
    pub pacing_rate: i64,
    pub max_pacing_rate: i64,
    pub bytes_acked: i64,
    pub bytes_received: i64,
    pub segs_out: i32,
    pub segs_in: i32,
    pub notsent_bytes: i32,
    #[serde(rename = "MinRTT")]
    pub min_rtt: i32,
    pub data_segs_in: i32,
    pub data_segs_out: i32,
    pub delivery_rate: i64,
    pub busy_time: i64,
    #[serde(rename = "RWndLimited")]
    pub rwnd_limited: i64,
    pub snd_buf_limited: i64,
    pub delivered: i32,
    #[serde(rename = "DeliveredCE")]
    pub delivered_ce: i32,
    pub bytes_sent: i64,
    pub bytes_retrans: i64,
    #[serde(rename = "DSackDups")]
    pub dsack_dups: i32,
    pub reord_seen: i32,
    pub elapsed_time: i64,
}

/// Counters sampled from a QUIC connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct QuicInfo {
    pub elapsed_time: i64,
    /// Payload bytes read from client-initiated streams.
    #[serde(rename = "QUICStreamBytesReceived")]
    pub stream_bytes_received: i64,
    /// UDP payload bytes sent on the connection.
    pub bytes_sent: i64,
    /// UDP payload bytes received on the connection.
    pub bytes_received: i64,
    /// Smoothed RTT, microseconds.
    #[serde(rename = "SmoothedRTT")]
    pub smoothed_rtt: i64,
    pub cwnd: i64,
    pub lost_packets: i64,
    pub congestion_events: i64,
}

/// One sampled instant, or one decoded peer report.
///
/// Statistics blocks are optional: a platform that cannot provide them
/// leaves them out of the JSON instead of reporting zeroes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Measurement {
    /// Time since the start of the test, microseconds.
    #[serde(default)]
    pub elapsed_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_info: Option<AppInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_info: Option<ConnectionInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Origin>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<SubtestKind>,
    #[serde(rename = "BBRInfo", default, skip_serializing_if = "Option::is_none")]
    pub bbr_info: Option<BbrInfo>,
    #[serde(rename = "TCPInfo", default, skip_serializing_if = "Option::is_none")]
    pub tcp_info: Option<TcpInfo>,
    #[serde(rename = "QUICInfo", default, skip_serializing_if = "Option::is_none")]
    pub quic_info: Option<QuicInfo>,
}

impl Measurement {
    /// A server sample stamped with `elapsed_us` and the session identity.
    pub fn server_sample(kind: SubtestKind, elapsed_us: i64, conn: ConnectionInfo) -> Self {
        Self {
            elapsed_time: elapsed_us,
            connection_info: Some(conn),
            origin: Some(Origin::Server),
            test: Some(kind),
            ..Default::default()
        }
    }
}
