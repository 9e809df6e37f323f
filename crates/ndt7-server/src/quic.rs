//! QUIC listener; the subtest comes from the negotiated ALPN.

use anyhow::{Context, Result};
use ndt7_engine::Session;
use ndt7_engine::session::new_uuid;
use ndt7_engine::transport::quic::{QuicTransport, negotiated_subtest, server_config};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse certificates in {}", path.display()))
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .with_context(|| format!("Failed to parse key in {}", path.display()))?
        .with_context(|| format!("No private key in {}", path.display()))
}

pub fn bind(addr: SocketAddr, cert: &Path, key: &Path) -> Result<quinn::Endpoint> {
    let config = server_config(load_certs(cert)?, load_key(key)?).context("Invalid TLS material")?;
    quinn::Endpoint::server(config, addr).with_context(|| format!("Failed to bind {addr}"))
}

pub async fn serve(endpoint: quinn::Endpoint, session: Session, shutdown: CancellationToken) -> Result<()> {
    let local = endpoint.local_addr()?;
    info!("ndt7+quic listening on {local}");
    loop {
        let incoming = tokio::select! {
            _ = shutdown.cancelled() => {
                endpoint.close(0u32.into(), b"shutdown");
                return Ok(());
            }
            incoming = endpoint.accept() => match incoming {
                Some(i) => i,
                None => return Ok(()),
            },
        };
        let session = session.clone();
        tokio::spawn(async move { handle(incoming, local, session).await });
    }
}

async fn handle(incoming: quinn::Incoming, local: SocketAddr, session: Session) {
    let conn = match incoming.await {
        Ok(conn) => conn,
        Err(e) => {
            debug!(error = %e, "handshake failed");
            return;
        }
    };
    let Some(kind) = negotiated_subtest(&conn) else {
        debug!(client = %conn.remote_address(), "no subtest negotiated");
        conn.close(1u32.into(), b"unknown subtest");
        return;
    };

    let transport = QuicTransport::new(conn.clone(), local, new_uuid(), session.bounds(), true);
    match session.run_measurement(kind, transport, &[]).await {
        Ok(outcome) => {
            if let Some(e) = outcome.error {
                debug!(error = %e, "subtest ended with an error");
            }
        }
        Err(e) => warn!(error = %e, "session failed"),
    }
    conn.close(0u32.into(), b"done");
}
