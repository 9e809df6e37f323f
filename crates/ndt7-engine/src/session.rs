//! Full lifecycle of one client connection: identity, metadata, the
//! subtest itself, rate, counters and the persisted record.

use crate::error::{SenderError, SessionError};
use crate::observer::{Observer, result_label};
use crate::results::ResultSink;
use crate::subtest::run_subtest;
use crate::transport::Transport;
use chrono::Utc;
use ndt7_model::{ArchivalData, ConnectionInfo, Measurement, NameValue, Ndt7Result, SessionBounds, SubtestKind};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Fresh identifier for a connection.
pub fn new_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Adds request parameters to the client metadata. Keys starting with
/// `server_` are reserved and skipped; only the first value of a repeated
/// key is kept.
pub fn append_client_metadata(data: &mut ArchivalData, query: &[(String, String)]) {
    let mut seen = HashSet::new();
    for (name, value) in query {
        if name.starts_with("server_") || !seen.insert(name.as_str()) {
            continue;
        }
        data.client_metadata.push(NameValue::new(name.clone(), value.clone()));
    }
}

fn mbps(bytes: i64, elapsed_us: i64) -> f64 {
    if elapsed_us <= 0 {
        return 0.0;
    }
    8.0 * bytes as f64 / elapsed_us as f64
}

fn client_rate(client: &[Measurement]) -> f64 {
    client
        .last()
        .and_then(|m| m.app_info.as_ref())
        .map_or(0.0, |a| mbps(a.num_bytes, a.elapsed_time))
}

/// Download rate in Mbps from the last server sample (bytes acknowledged
/// by the client), or from the client's own report when the server had no
/// statistics.
pub fn download_rate(data: &ArchivalData) -> f64 {
    let server = data.server_measurements.last().map_or(0.0, |m| {
        if let Some(tcp) = &m.tcp_info {
            mbps(tcp.bytes_acked, tcp.elapsed_time)
        } else if let Some(quic) = &m.quic_info {
            mbps(quic.bytes_sent, quic.elapsed_time)
        } else {
            0.0
        }
    });
    if server > 0.0 {
        server
    } else {
        client_rate(&data.client_measurements)
    }
}

/// Upload rate in Mbps from the last server sample (bytes received from
/// the client).
pub fn upload_rate(data: &ArchivalData) -> f64 {
    let server = data.server_measurements.last().map_or(0.0, |m| {
        if let Some(tcp) = &m.tcp_info {
            mbps(tcp.bytes_received, tcp.elapsed_time)
        } else if let Some(quic) = &m.quic_info {
            mbps(quic.stream_bytes_received, quic.elapsed_time)
        } else {
            0.0
        }
    });
    if server > 0.0 {
        server
    } else {
        client_rate(&data.client_measurements)
    }
}

fn split_addr(addr: &str) -> (String, u16) {
    match addr.parse::<SocketAddr>() {
        Ok(a) => (a.ip().to_string(), a.port()),
        Err(_) => (IpAddr::V6(Ipv6Addr::LOCALHOST).to_string(), 1),
    }
}

fn new_result(conn: &ConnectionInfo) -> Ndt7Result {
    let (client_ip, client_port) = split_addr(&conn.client);
    let (server_ip, server_port) = split_addr(&conn.server);
    Ndt7Result {
        version: env!("CARGO_PKG_VERSION").to_string(),
        client_ip,
        client_port,
        server_ip,
        server_port,
        ..Default::default()
    }
}

/// What a finished session produced.
#[derive(Debug)]
pub struct SessionOutcome {
    pub result: Ndt7Result,
    pub rate_mbps: f64,
    /// Terminal sender error, if the subtest failed.
    pub error: Option<SenderError>,
}

/// Shared state for every connection served by one process.
#[derive(Clone)]
pub struct Session {
    bounds: SessionBounds,
    server_metadata: Vec<NameValue>,
    observer: Arc<dyn Observer>,
    results: Arc<dyn ResultSink>,
}

impl Session {
    pub fn new(
        bounds: SessionBounds,
        observer: Arc<dyn Observer>,
        results: Arc<dyn ResultSink>,
    ) -> Result<Self, SessionError> {
        bounds.validate()?;
        Ok(Self {
            bounds,
            server_metadata: Vec::new(),
            observer,
            results,
        })
    }

    pub fn with_server_metadata(mut self, metadata: Vec<NameValue>) -> Self {
        self.server_metadata = metadata;
        self
    }

    pub fn bounds(&self) -> &SessionBounds {
        &self.bounds
    }

    pub fn observer(&self) -> &Arc<dyn Observer> {
        &self.observer
    }

    /// Runs one subtest on `transport` and persists its record.
    ///
    /// The connection is force-closed once `max_runtime` has passed, and
    /// again when this returns. The record is written even when the subtest
    /// failed.
    pub async fn run_measurement<T: Transport>(
        &self,
        kind: SubtestKind,
        transport: T,
        query: &[(String, String)],
    ) -> Result<SessionOutcome, SessionError> {
        let conn = transport.connection_info().clone();
        if conn.uuid.is_empty() {
            self.observer.client_connection(kind, "uuid-error");
            return Err(SessionError::MissingUuid);
        }
        self.observer.client_connection(kind, "result");
        let proto = transport.protocol();

        let scope = CancellationToken::new();
        let _cancel_on_exit = scope.clone().drop_guard();
        let watchdog = {
            let scope = scope.clone();
            let close = transport.close_handle();
            let max_runtime = self.bounds.max_runtime;
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(max_runtime) => {}
                    _ = scope.cancelled() => {}
                }
                scope.cancel();
                close.cancel();
            })
        };

        let mut data = ArchivalData::new(conn.uuid.clone());
        append_client_metadata(&mut data, query);
        data.server_metadata = self.server_metadata.clone();
        let mut result = new_result(&conn);
        result.start_time = Some(Utc::now());
        info!(uuid = %conn.uuid, client = %conn.client, "{} {} started", proto, kind);

        let outcome = run_subtest(kind, transport, &scope, &self.bounds, &mut data, self.observer.clone()).await;

        let rate = match kind {
            SubtestKind::Download => download_rate(&data),
            SubtestKind::Upload => upload_rate(&data),
        };
        self.observer
            .test_result(proto, kind, result_label(outcome.is_err(), rate));
        if rate > 0.0 {
            self.observer.test_rate(proto, kind, rate);
        }

        scope.cancel();
        if let Err(e) = watchdog.await {
            warn!(error = %e, "watchdog task failed");
        }

        result.end_time = Some(Utc::now());
        match kind {
            SubtestKind::Download => result.download = Some(data),
            SubtestKind::Upload => result.upload = Some(data),
        }
        if let Err(e) = self.results.write(kind, &result) {
            warn!(error = %e, "cannot write result");
        }
        info!(uuid = %conn.uuid, "{} {} done: {:.3} Mbps", proto, kind, rate);

        Ok(SessionOutcome {
            result,
            rate_mbps: rate,
            error: outcome.err(),
        })
    }
}
