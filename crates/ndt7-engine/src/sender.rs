use crate::error::SenderError;
use crate::measurer::{MeasurementSource, Measurer};
use crate::observer::Observer;
use crate::ping::TickClock;
use crate::transport::{StatsSource, UnitSink};
use bytes::Bytes;
use chrono::Utc;
use ndt7_model::protocol::{MAX_SCALED_MESSAGE_SIZE, MIN_MESSAGE_SIZE, SCALING_FRACTION};
use ndt7_model::{ArchivalData, Measurement, SessionBounds, SubtestKind};
use rand::Rng;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Download load messages, growing with the amount of data already sent.
#[derive(Debug)]
pub(crate) struct LoadGenerator {
    message: Bytes,
    total_sent: usize,
}

impl LoadGenerator {
    pub(crate) fn new() -> Self {
        Self {
            message: random_message(MIN_MESSAGE_SIZE),
            total_sent: 0,
        }
    }

    pub(crate) fn next_message(&mut self) -> Bytes {
        let msg = self.message.clone();
        let size = msg.len();
        self.total_sent += size;
        if size < MAX_SCALED_MESSAGE_SIZE && size < self.total_sent / SCALING_FRACTION {
            self.message = random_message(size * 2);
        }
        msg
    }
}

fn random_message(size: usize) -> Bytes {
    let mut rng = rand::rng();
    let payload: Vec<u8> = (0..size).map(|_| rng.random_range(b'a'..=b'z')).collect();
    Bytes::from(payload)
}

/// Write side of a subtest.
pub struct Sender<'a, K> {
    sink: &'a mut K,
    kind: SubtestKind,
    proto: &'static str,
    clock: TickClock,
    observer: &'a dyn Observer,
}

impl<'a, K: UnitSink> Sender<'a, K> {
    pub fn new(
        sink: &'a mut K,
        kind: SubtestKind,
        proto: &'static str,
        clock: TickClock,
        observer: &'a dyn Observer,
    ) -> Self {
        Self {
            sink,
            kind,
            proto,
            clock,
            observer,
        }
    }

    /// Streams measurements to the peer until the measurer is done, then
    /// half-closes the connection.
    ///
    /// Each measurement lands in `data.server_measurements` only after it
    /// was written. On download, load messages fill the gaps between
    /// measurements.
    pub async fn run<S: StatsSource>(
        mut self,
        measurer: Measurer<S>,
        scope: &CancellationToken,
        bounds: &SessionBounds,
        data: &mut ArchivalData,
    ) -> Result<(), SenderError> {
        debug!("sender: start");
        let mut src = measurer.start(scope, bounds.default_runtime);
        let result = self.send_all(&mut src, bounds, data).await;
        src.stop().await;
        if let Err(e) = &result {
            warn!(error = %e, "sender: {} failed", e.label());
            self.observer.sender_error(self.proto, self.kind, e.label());
        }
        debug!("sender: stop");
        result
    }

    async fn send_all(
        &mut self,
        src: &mut MeasurementSource,
        bounds: &SessionBounds,
        data: &mut ArchivalData,
    ) -> Result<(), SenderError> {
        let deadline = Instant::now() + bounds.max_runtime;
        self.sink
            .set_write_deadline(deadline)
            .map_err(SenderError::SetWriteDeadline)?;

        data.start_time = Some(Utc::now());
        let result = match self.kind {
            SubtestKind::Upload => self.upload_loop(src, data).await,
            SubtestKind::Download => self.download_loop(src, data).await,
        };
        data.end_time = Some(Utc::now());
        result
    }

    async fn upload_loop(
        &mut self,
        src: &mut MeasurementSource,
        data: &mut ArchivalData,
    ) -> Result<(), SenderError> {
        while let Some(m) = src.recv().await {
            self.deliver(m, data).await?;
        }
        self.finish().await;
        Ok(())
    }

    async fn download_loop(
        &mut self,
        src: &mut MeasurementSource,
        data: &mut ArchivalData,
    ) -> Result<(), SenderError> {
        let mut load = LoadGenerator::new();
        loop {
            match src.try_recv() {
                Ok(m) => self.deliver(m, data).await?,
                Err(TryRecvError::Empty) => {
                    self.sink
                        .send_load(load.next_message())
                        .await
                        .map_err(SenderError::WriteLoad)?;
                }
                Err(TryRecvError::Disconnected) => break,
            }
        }
        self.finish().await;
        Ok(())
    }

    async fn deliver(&mut self, m: Measurement, data: &mut ArchivalData) -> Result<(), SenderError> {
        let text = serde_json::to_string(&m)?;
        self.sink
            .send_text(text)
            .await
            .map_err(SenderError::WriteMeasurement)?;
        data.server_measurements.push(m);
        self.sink
            .send_probe(self.clock.probe())
            .await
            .map_err(SenderError::Probe)
    }

    async fn finish(&mut self) {
        if let Err(e) = self.sink.close().await {
            debug!(error = %e, "sender: close failed");
        }
        self.observer
            .sender_error(self.proto, self.kind, "measurer-closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::NoopObserver;
    use crate::transport::Transport;
    use crate::transport::memory::{Frame, pair};
    use ndt7_model::{ConnectionInfo, SamplingConfig};
    use std::sync::Arc;
    use std::time::Duration;

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

    #[test]
    fn test_load_message_doubles_with_total_sent() {
        let mut load = LoadGenerator::new();
        let mut sizes = Vec::new();
        for _ in 0..200 {
            sizes.push(load.next_message().len());
        }
        assert_eq!(sizes[0], MIN_MESSAGE_SIZE);
        assert!(sizes.windows(2).all(|w| w[1] == w[0] || w[1] == w[0] * 2));
        assert!(sizes.iter().all(|&s| s <= MAX_SCALED_MESSAGE_SIZE));
        // Growth needs 16x the current size already sent.
        assert_eq!(sizes[16], MIN_MESSAGE_SIZE);
        assert_eq!(sizes[17], MIN_MESSAGE_SIZE * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_sender_archives_delivered_measurements() {
        let (transport, mut peer) = pair(ConnectionInfo::default());
        let (mut sink, _source, stats) = transport.split();
        let observer = NoopObserver;
        let measurer = Measurer::new(
            stats,
            ConnectionInfo::default(),
            SubtestKind::Upload,
            bounds().sampling,
            Arc::new(NoopObserver),
        );
        let mut data = ArchivalData::new("s-1");
        let scope = CancellationToken::new();
        Sender::new(&mut sink, SubtestKind::Upload, "memory", TickClock::new(), &observer)
            .run(measurer, &scope, &bounds(), &mut data)
            .await
            .unwrap();

        let mut texts = 0;
        let mut pings = 0;
        let mut closed = false;
        while let Ok(frame) = peer.inbound.try_recv() {
            match frame {
                Frame::Text(_) => texts += 1,
                Frame::Ping(_) => pings += 1,
                Frame::Close => closed = true,
                other => panic!("unexpected frame {other:?}"),
            }
        }
        assert!(closed);
        assert_eq!(texts, data.server_measurements.len());
        assert_eq!(pings, texts);
        assert!(data.start_time.is_some() && data.end_time.is_some());
        assert!(data.start_time <= data.end_time);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_is_returned_and_keeps_partial_archive() {
        let (transport, peer) = pair(ConnectionInfo::default());
        let (mut sink, _source, stats) = transport.split();
        drop(peer);
        let observer = NoopObserver;
        let measurer = Measurer::new(
            stats,
            ConnectionInfo::default(),
            SubtestKind::Upload,
            bounds().sampling,
            Arc::new(NoopObserver),
        );
        let mut data = ArchivalData::new("s-2");
        let scope = CancellationToken::new();
        let err = Sender::new(&mut sink, SubtestKind::Upload, "memory", TickClock::new(), &observer)
            .run(measurer, &scope, &bounds(), &mut data)
            .await
            .unwrap_err();
        assert_eq!(err.label(), "write-json");
        assert!(data.server_measurements.is_empty());
        assert!(data.end_time.is_some());
    }
}
