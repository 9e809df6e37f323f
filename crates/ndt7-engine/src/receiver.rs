use crate::error::ReceiveError;
use crate::observer::Observer;
use crate::ping::TickClock;
use crate::transport::{Unit, UnitSource};
use ndt7_model::{Measurement, SessionBounds, SubtestKind};
use std::sync::Arc;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

enum Exit {
    Expired,
    Closed,
    Failed(ReceiveError),
}

/// Read side of a subtest.
///
/// Runs in its own task and owns the client measurements until it ends;
/// the orchestrator gets them back by joining the task.
pub struct Receiver<U> {
    source: U,
    kind: SubtestKind,
    proto: &'static str,
    clock: TickClock,
    observer: Arc<dyn Observer>,
}

impl<U: UnitSource> Receiver<U> {
    pub fn new(
        source: U,
        kind: SubtestKind,
        proto: &'static str,
        clock: TickClock,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            source,
            kind,
            proto,
            clock,
            observer,
        }
    }

    /// Collects client measurements until the connection closes, a
    /// protocol error occurs, or `max_runtime` elapses.
    pub async fn run(mut self, scope: CancellationToken, bounds: SessionBounds) -> Vec<Measurement> {
        debug!("receiver: start");
        self.source.set_read_limit(bounds.max_message_size);
        let deadline = Instant::now() + bounds.max_runtime;
        let mut received = Vec::new();
        let exit = match self.source.set_read_deadline(deadline) {
            Ok(()) => self.read_loop(&scope, deadline, &mut received).await,
            Err(e) => Exit::Failed(ReceiveError::SetReadDeadline(e)),
        };
        let reason = match &exit {
            Exit::Expired => "receiver-context-expired",
            Exit::Closed => "connection-closed",
            Exit::Failed(e) => {
                warn!(error = %e, "receiver: {}", e.label());
                e.label()
            }
        };
        self.observer.receiver_error(self.proto, self.kind, reason);
        debug!("receiver: stop");
        received
    }

    async fn read_loop(
        &mut self,
        scope: &CancellationToken,
        deadline: Instant,
        received: &mut Vec<Measurement>,
    ) -> Exit {
        loop {
            let unit = tokio::select! {
                _ = scope.cancelled() => return Exit::Expired,
                _ = sleep_until(deadline) => return Exit::Expired,
                unit = self.source.next_unit() => unit,
            };
            match unit {
                Ok(None) => return Exit::Closed,
                Err(e) => return Exit::Failed(ReceiveError::Read(e)),
                Ok(Some(Unit::Pong(payload))) => match self.clock.parse_echo(&payload) {
                    Ok(rtt) => debug!("receiver: application level RTT: {} ms", rtt.as_millis()),
                    Err(e) => return Exit::Failed(ReceiveError::PingParse(e)),
                },
                Ok(Some(Unit::Binary(_))) => {
                    if self.kind == SubtestKind::Download {
                        return Exit::Failed(ReceiveError::WrongMessageType);
                    }
                }
                Ok(Some(Unit::Text(text))) => match serde_json::from_str::<Measurement>(&text) {
                    Ok(mut m) => {
                        // Archive time of arrival; the client's own clock stays in AppInfo.
                        m.elapsed_time = self.clock.ticks() / 1000;
                        received.push(m);
                    }
                    Err(e) => return Exit::Failed(ReceiveError::Unmarshal(e)),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::NoopObserver;
    use crate::transport::Transport;
    use crate::transport::memory::{Frame, MemoryPeer, MemorySource, pair};
    use ndt7_model::ConnectionInfo;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Reasons(Mutex<Vec<String>>);

    impl Observer for Reasons {
        fn receiver_error(&self, _proto: &str, _kind: SubtestKind, reason: &str) {
            self.0.lock().unwrap().push(reason.to_string());
        }
    }

    const REPORT: &str = r#"{"AppInfo":{"ElapsedTime":1000,"NumBytes":2048},"Origin":"client","Test":"download"}"#;

    fn setup() -> (MemorySource, MemoryPeer) {
        let (transport, peer) = pair(ConnectionInfo::default());
        let (_sink, source, _stats) = transport.split();
        (source, peer)
    }

    fn bounds() -> SessionBounds {
        SessionBounds {
            max_runtime: Duration::from_secs(2),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_rejects_binary() {
        let (source, peer) = setup();
        let observer = Arc::new(Reasons::default());
        peer.send(Frame::Text(REPORT.into()));
        peer.send(Frame::Binary(512));
        peer.send(Frame::Text(REPORT.into()));
        let receiver = Receiver::new(
            source,
            SubtestKind::Download,
            "memory",
            TickClock::new(),
            observer.clone(),
        );
        let got = receiver.run(CancellationToken::new(), bounds()).await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].app_info.as_ref().map(|a| a.num_bytes), Some(2048));
        assert_eq!(*observer.0.lock().unwrap(), vec!["wrong-message-type"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_skips_binary() {
        let (source, peer) = setup();
        let observer = Arc::new(Reasons::default());
        peer.send(Frame::Binary(512));
        peer.send(Frame::Text(REPORT.into()));
        peer.send(Frame::Binary(512));
        peer.send(Frame::Text(REPORT.into()));
        peer.send(Frame::Close);
        let receiver = Receiver::new(
            source,
            SubtestKind::Upload,
            "memory",
            TickClock::new(),
            observer.clone(),
        );
        let got = receiver.run(CancellationToken::new(), bounds()).await;
        assert_eq!(got.len(), 2);
        assert_eq!(*observer.0.lock().unwrap(), vec!["connection-closed"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_json_stops_receiver() {
        let (source, peer) = setup();
        let observer = Arc::new(Reasons::default());
        peer.send(Frame::Text("{not json".into()));
        peer.send(Frame::Text(REPORT.into()));
        let receiver = Receiver::new(
            source,
            SubtestKind::Upload,
            "memory",
            TickClock::new(),
            observer.clone(),
        );
        let got = receiver.run(CancellationToken::new(), bounds()).await;
        assert!(got.is_empty());
        assert_eq!(*observer.0.lock().unwrap(), vec!["unmarshal-client-message"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_is_bounded_by_max_runtime() {
        let (source, _peer) = setup();
        let begin = Instant::now();
        let receiver = Receiver::new(
            source,
            SubtestKind::Download,
            "memory",
            TickClock::new(),
            Arc::new(NoopObserver),
        );
        let got = receiver.run(CancellationToken::new(), bounds()).await;
        assert!(got.is_empty());
        let waited = Instant::now() - begin;
        assert!(waited >= Duration::from_secs(2) && waited < Duration::from_millis(2100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_reports_are_stamped_on_arrival() {
        let (source, peer) = setup();
        let clock = TickClock::new();
        let receiver = Receiver::new(source, SubtestKind::Upload, "memory", clock, Arc::new(NoopObserver));
        let task = tokio::spawn(receiver.run(CancellationToken::new(), bounds()));

        tokio::time::sleep(Duration::from_millis(10)).await;
        peer.send(Frame::Text(
            r#"{"ElapsedTime":500000,"AppInfo":{"ElapsedTime":500000,"NumBytes":1}}"#.into(),
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        peer.send(Frame::Text(
            r#"{"ElapsedTime":100,"AppInfo":{"ElapsedTime":100,"NumBytes":2}}"#.into(),
        ));
        peer.send(Frame::Close);
        let got = task.await.unwrap();

        assert_eq!(got.len(), 2);
        let stamps: Vec<i64> = got.iter().map(|m| m.elapsed_time).collect();
        assert!(stamps[0] >= 10_000 && stamps[0] < 100_000, "{stamps:?}");
        assert!(stamps[1] - stamps[0] >= 100_000, "{stamps:?}");
        let peer_times: Vec<i64> = got
            .iter()
            .map(|m| m.app_info.as_ref().unwrap().elapsed_time)
            .collect();
        assert_eq!(peer_times, vec![500_000, 100]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_is_logged_not_archived() {
        let (source, peer) = setup();
        let clock = TickClock::new();
        peer.send(Frame::Pong(clock.probe()));
        peer.send(Frame::Close);
        let receiver = Receiver::new(source, SubtestKind::Download, "memory", clock, Arc::new(NoopObserver));
        let got = receiver.run(CancellationToken::new(), bounds()).await;
        assert!(got.is_empty());
    }
}
