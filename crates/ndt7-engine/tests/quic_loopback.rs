use ndt7_engine::transport::quic::{QuicTransport, negotiated_subtest, server_config};
use ndt7_engine::{NoopObserver, Observer, run_upload};
use ndt7_model::{ArchivalData, SamplingConfig, SessionBounds, SubtestKind};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const REPORT: &[u8] = br#"{"AppInfo":{"ElapsedTime":100000,"NumBytes":100000},"Origin":"client","Test":"upload"}"#;

fn client_config(cert: CertificateDer<'static>, alpn: &[u8]) -> quinn::ClientConfig {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert).unwrap();
    let mut tls = rustls::ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    tls.alpn_protocols = vec![alpn.to_vec()];
    quinn::ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(tls).unwrap(),
    ))
}

/// Reads server streams and echoes probes until the connection closes;
/// returns how many server messages arrived.
async fn drain_server(conn: quinn::Connection) -> usize {
    let mut texts = 0;
    loop {
        tokio::select! {
            stream = conn.accept_uni() => match stream {
                Ok(mut recv) => {
                    if recv.read_to_end(1 << 20).await.is_ok() {
                        texts += 1;
                    }
                }
                Err(_) => break,
            },
            datagram = conn.read_datagram() => match datagram {
                Ok(payload) => {
                    let _ = conn.send_datagram(payload);
                }
                Err(_) => break,
            },
        }
    }
    texts
}

/// Plays an upload client: one report, one load stream, then drains.
async fn upload_client(conn: quinn::Connection) -> usize {
    let mut report = conn.open_uni().await.unwrap();
    report.write_all(REPORT).await.unwrap();
    report.finish().unwrap();
    let mut load = conn.open_uni().await.unwrap();
    load.write_all(&vec![b'x'; 100_000]).await.unwrap();
    load.finish().unwrap();
    drain_server(conn).await
}

struct Loopback {
    _server: quinn::Endpoint,
    _client: quinn::Endpoint,
    server_addr: SocketAddr,
    server_conn: quinn::Connection,
    client_conn: quinn::Connection,
}

async fn loopback(alpn: &[u8]) -> Loopback {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_der = cert.der().clone();
    let key = PrivatePkcs8KeyDer::from(key_pair.serialize_der());

    let server = quinn::Endpoint::server(
        server_config(vec![cert_der.clone()], key.into()).unwrap(),
        "127.0.0.1:0".parse().unwrap(),
    )
    .unwrap();
    let server_addr = server.local_addr().unwrap();
    let mut client = quinn::Endpoint::client("127.0.0.1:0".parse().unwrap()).unwrap();
    client.set_default_client_config(client_config(cert_der, alpn));

    let connecting = client.connect(server_addr, "localhost").unwrap();
    let (incoming, client_conn) = tokio::join!(server.accept(), connecting);
    let server_conn = incoming.unwrap().await.unwrap();
    Loopback {
        _server: server,
        _client: client,
        server_addr,
        server_conn,
        client_conn: client_conn.unwrap(),
    }
}

fn bounds(max_runtime: Duration, default_runtime: Duration, accept_timeout: Duration) -> SessionBounds {
    SessionBounds {
        max_runtime,
        default_runtime,
        accept_timeout,
        sampling: SamplingConfig {
            min: Duration::from_millis(20),
            expected: Duration::from_millis(50),
            max: Duration::from_millis(100),
        },
        ..Default::default()
    }
}

/// Records when and why the receiver stopped.
#[derive(Default)]
struct ReceiverExit(Mutex<Option<(Instant, String)>>);

impl Observer for ReceiverExit {
    fn receiver_error(&self, _proto: &str, _kind: SubtestKind, reason: &str) {
        *self.0.lock().unwrap() = Some((Instant::now(), reason.to_string()));
    }
}

#[tokio::test]
async fn upload_over_quic() {
    let lb = loopback(b"ndt7-upload").await;
    assert_eq!(negotiated_subtest(&lb.server_conn), Some(SubtestKind::Upload));

    let client_task = tokio::spawn(upload_client(lb.client_conn.clone()));
    let bounds = bounds(Duration::from_secs(3), Duration::from_millis(500), Duration::from_secs(2));
    let transport = QuicTransport::new(lb.server_conn.clone(), lb.server_addr, "q-1".into(), &bounds, true);
    let mut data = ArchivalData::new("q-1");
    let res = run_upload(
        transport,
        &CancellationToken::new(),
        &bounds,
        &mut data,
        Arc::new(NoopObserver),
    )
    .await;
    lb.server_conn.close(0u32.into(), b"done");
    let texts = client_task.await.unwrap();

    assert!(res.is_ok(), "{res:?}");
    assert_eq!(data.client_measurements.len(), 1);
    assert!(!data.server_measurements.is_empty());
    assert_eq!(texts, data.server_measurements.len());
    let quic = data.server_measurements.last().unwrap().quic_info.clone().unwrap();
    assert!(quic.stream_bytes_received >= 100_000 + REPORT.len() as i64);
    assert!(quic.bytes_received > 0);
}

#[tokio::test]
async fn unfinished_client_stream_is_cut_off_after_linger() {
    let lb = loopback(b"ndt7-upload").await;
    let trickle = {
        let conn = lb.client_conn.clone();
        tokio::spawn(async move {
            let mut stream = conn.open_uni().await.unwrap();
            for _ in 0..100 {
                if stream.write_all(&[b'x'; 512]).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
    };
    let drain = tokio::spawn(drain_server(lb.client_conn.clone()));

    let bounds = bounds(Duration::from_secs(8), Duration::from_millis(500), Duration::from_secs(5));
    let transport = QuicTransport::new(lb.server_conn.clone(), lb.server_addr, "q-2".into(), &bounds, true);
    let mut data = ArchivalData::new("q-2");
    let observer = Arc::new(ReceiverExit::default());
    let begin = Instant::now();
    let res = run_upload(
        transport,
        &CancellationToken::new(),
        &bounds,
        &mut data,
        observer.clone(),
    )
    .await;
    let took = begin.elapsed();
    lb.server_conn.close(0u32.into(), b"done");
    trickle.abort();
    let _ = drain.await;

    assert!(res.is_ok(), "{res:?}");
    // Measurer runtime plus the close linger, far below max_runtime.
    assert!(took >= Duration::from_millis(500), "took {took:?}");
    assert!(took < Duration::from_secs(3), "took {took:?}");
    let exit = observer.0.lock().unwrap().clone().unwrap();
    assert_eq!(exit.1, "connection-closed");
}

#[tokio::test]
async fn idle_client_hits_accept_timeout_from_bounds() {
    let lb = loopback(b"ndt7-upload").await;
    // Reads server streams but never echoes probes, so nothing reaches
    // the server's receiver.
    let drain = {
        let conn = lb.client_conn.clone();
        tokio::spawn(async move {
            while let Ok(mut recv) = conn.accept_uni().await {
                let _ = recv.read_to_end(1 << 20).await;
            }
        })
    };

    let bounds = bounds(Duration::from_secs(4), Duration::from_millis(1500), Duration::from_millis(300));
    let transport = QuicTransport::new(lb.server_conn.clone(), lb.server_addr, "q-3".into(), &bounds, true);
    let mut data = ArchivalData::new("q-3");
    let observer = Arc::new(ReceiverExit::default());
    let begin = Instant::now();
    let res = run_upload(
        transport,
        &CancellationToken::new(),
        &bounds,
        &mut data,
        observer.clone(),
    )
    .await;
    lb.server_conn.close(0u32.into(), b"done");
    let _ = drain.await;

    assert!(res.is_ok(), "{res:?}");
    let (at, reason) = observer.0.lock().unwrap().clone().unwrap();
    assert_eq!(reason, "read-message");
    assert!(at - begin < Duration::from_secs(1), "receiver ran {:?}", at - begin);
    assert!(data.client_measurements.is_empty());
}
