use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use ndt7_engine::transport::websocket::WebSocketTransport;
use ndt7_engine::{Observer, run_download, run_upload};
use ndt7_model::{ArchivalData, SamplingConfig, SessionBounds, SubtestKind};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const REPORT: &str = r#"{"AppInfo":{"ElapsedTime":100000,"NumBytes":4096},"Origin":"client","Test":"download"}"#;

async fn connected(path: &str, uuid: &str) -> (WebSocketTransport<TcpStream>, Client) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = async {
        let (tcp, _) = listener.accept().await.unwrap();
        tokio_tungstenite::accept_async(tcp).await.unwrap()
    };
    let client = async {
        tokio_tungstenite::connect_async(format!("ws://{addr}{path}"))
            .await
            .unwrap()
            .0
    };
    let (server, client) = tokio::join!(server, client);
    (WebSocketTransport::from_tcp(server, uuid.into()).unwrap(), client)
}

fn bounds() -> SessionBounds {
    SessionBounds {
        max_runtime: Duration::from_secs(2),
        default_runtime: Duration::from_secs(1),
        sampling: SamplingConfig {
            min: Duration::from_millis(50),
            expected: Duration::from_millis(100),
            max: Duration::from_millis(200),
        },
        ..Default::default()
    }
}

/// Reads everything the server sends; the library answers pings and the
/// close handshake on its own. Returns the number of text messages.
async fn read_all(mut client: Client) -> usize {
    let mut texts = 0;
    while let Some(Ok(msg)) = client.next().await {
        if msg.is_text() {
            texts += 1;
        }
    }
    texts
}

#[derive(Default)]
struct ReceiverReasons(Mutex<Vec<String>>);

impl Observer for ReceiverReasons {
    fn receiver_error(&self, _proto: &str, _kind: SubtestKind, reason: &str) {
        self.0.lock().unwrap().push(reason.to_string());
    }
}

#[tokio::test]
async fn upload_with_silent_client_is_bounded() {
    let (transport, client) = connected("/ndt/v7/upload", "ws-1").await;
    let client = tokio::spawn(read_all(client));

    let mut data = ArchivalData::new("ws-1");
    let observer = Arc::new(ReceiverReasons::default());
    let begin = Instant::now();
    let res = run_upload(
        transport,
        &CancellationToken::new(),
        &bounds(),
        &mut data,
        observer.clone(),
    )
    .await;
    let took = begin.elapsed();
    let texts = client.await.unwrap();

    assert!(res.is_ok(), "{res:?}");
    assert!(took < Duration::from_millis(2100), "took {took:?}");
    assert!(!data.server_measurements.is_empty());
    assert_eq!(texts, data.server_measurements.len());
    assert!(data.client_measurements.is_empty());
    assert_eq!(observer.0.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn download_receiver_stops_on_binary_frame() {
    let (transport, mut client) = connected("/ndt/v7/download", "ws-2").await;
    client.send(Message::Text(REPORT.into())).await.unwrap();
    client
        .send(Message::Binary(Bytes::from(vec![0u8; 1024])))
        .await
        .unwrap();
    client.send(Message::Text(REPORT.into())).await.unwrap();
    let client = tokio::spawn(read_all(client));

    let mut data = ArchivalData::new("ws-2");
    let observer = Arc::new(ReceiverReasons::default());
    let begin = Instant::now();
    let res = run_download(
        transport,
        &CancellationToken::new(),
        &bounds(),
        &mut data,
        observer.clone(),
    )
    .await;
    let took = begin.elapsed();
    let texts = client.await.unwrap();

    // The violation ends only the receiver; the sender still completes.
    assert!(res.is_ok(), "{res:?}");
    assert!(took < Duration::from_millis(2100), "took {took:?}");
    assert_eq!(data.client_measurements.len(), 1);
    assert_eq!(*observer.0.lock().unwrap(), vec!["wrong-message-type"]);
    assert!(!data.server_measurements.is_empty());
    assert_eq!(texts, data.server_measurements.len());
}
