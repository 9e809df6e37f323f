//! Randomized sampling of connection statistics.

use crate::observer::Observer;
use crate::transport::StatsSource;
use ndt7_model::{ConnectionInfo, Measurement, SamplingConfig, SubtestKind};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Draws exponentially distributed gaps with mean `expected`, clamped to
/// `[min, max]`.
pub(crate) fn next_gap<R: Rng>(rng: &mut R, sampling: &SamplingConfig) -> Duration {
    let u: f64 = rng.random();
    let secs = -(1.0 - u).ln() * sampling.expected.as_secs_f64();
    Duration::from_secs_f64(secs).clamp(sampling.min, sampling.max)
}

pub struct Measurer<S> {
    stats: S,
    conn: ConnectionInfo,
    kind: SubtestKind,
    sampling: SamplingConfig,
    observer: Arc<dyn Observer>,
}

impl<S: StatsSource> Measurer<S> {
    pub fn new(
        stats: S,
        conn: ConnectionInfo,
        kind: SubtestKind,
        sampling: SamplingConfig,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            stats,
            conn,
            kind,
            sampling,
            observer,
        }
    }

    /// Starts sampling in a background task.
    ///
    /// The returned source closes once `timeout` elapses or `scope` is
    /// cancelled. It yields nothing at all when the statistics cannot be
    /// read; callers treat that as "no data", not as a failure.
    pub fn start(self, scope: &CancellationToken, timeout: Duration) -> MeasurementSource {
        let (tx, rx) = mpsc::channel(1);
        let token = scope.child_token();
        let task = tokio::spawn(self.run(tx, token.clone(), timeout));
        MeasurementSource {
            rx,
            token,
            task: Some(task),
        }
    }

    async fn run(
        mut self,
        tx: mpsc::Sender<Measurement>,
        token: CancellationToken,
        timeout: Duration,
    ) {
        debug!("measurer: start");
        if let Err(e) = self.stats.prepare() {
            warn!(error = %e, "measurer: cannot read connection statistics");
            return;
        }
        if let Err(e) = self.sampling.validate() {
            warn!(error = %e, "measurer: invalid sampling interval");
            return;
        }
        match self.stats.enable_congestion_control() {
            Ok(()) => self.observer.bbr_enabled(true, ""),
            Err(e) => self.observer.bbr_enabled(false, &e.to_string()),
        }

        let start = Instant::now();
        let deadline = start + timeout;
        let mut rng = StdRng::from_os_rng();
        loop {
            let gap = next_gap(&mut rng, &self.sampling);
            tokio::select! {
                _ = token.cancelled() => break,
                _ = sleep_until(deadline) => break,
                _ = sleep(gap) => {}
            }
            let elapsed = start.elapsed();
            let mut m = Measurement::server_sample(
                self.kind,
                elapsed.as_micros() as i64,
                self.conn.clone(),
            );
            self.stats.sample(elapsed, &mut m);
            tokio::select! {
                _ = token.cancelled() => break,
                _ = sleep_until(deadline) => break,
                sent = tx.send(m) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("measurer: stop");
    }
}

/// Consumer end of a running [`Measurer`].
pub struct MeasurementSource {
    rx: mpsc::Receiver<Measurement>,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl MeasurementSource {
    /// Next sample; `None` once the measurer is done.
    pub async fn recv(&mut self) -> Option<Measurement> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Result<Measurement, TryRecvError> {
        self.rx.try_recv()
    }

    /// Stops the measurer and waits for its task to exit. Pending samples
    /// are drained and discarded. Calling it again is a no-op.
    pub async fn stop(&mut self) {
        self.token.cancel();
        self.rx.close();
        while self.rx.recv().await.is_some() {}
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "measurer: task failed");
            }
        }
    }
}

impl Drop for MeasurementSource {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
