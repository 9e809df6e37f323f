use ndt7_model::SubtestKind;
use tracing::{debug, info};

/// Receives the counters emitted while subtests run.
///
/// Every method has a no-op default so implementations only override
/// what they export.
pub trait Observer: Send + Sync {
    /// A sender stopped; `reason` is `measurer-closed` on the normal path.
    fn sender_error(&self, _proto: &str, _kind: SubtestKind, _reason: &str) {}

    /// A receiver stopped; `reason` is `receiver-context-expired` when the
    /// loop ran until its scope ended.
    fn receiver_error(&self, _proto: &str, _kind: SubtestKind, _reason: &str) {}

    /// Outcome of connection setup (`result`, `uuid-error`, ...).
    fn client_connection(&self, _kind: SubtestKind, _status: &str) {}

    fn test_result(&self, _proto: &str, _kind: SubtestKind, _label: &str) {}

    /// Observed rate in Mbps, only reported when positive.
    fn test_rate(&self, _proto: &str, _kind: SubtestKind, _mbps: f64) {}

    fn bbr_enabled(&self, _success: bool, _error: &str) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl Observer for NoopObserver {}

/// Forwards every counter to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl Observer for LogObserver {
    fn sender_error(&self, proto: &str, kind: SubtestKind, reason: &str) {
        debug!(proto, %kind, reason, "sender stopped");
    }

    fn receiver_error(&self, proto: &str, kind: SubtestKind, reason: &str) {
        debug!(proto, %kind, reason, "receiver stopped");
    }

    fn client_connection(&self, kind: SubtestKind, status: &str) {
        debug!(%kind, status, "client connection");
    }

    fn test_result(&self, proto: &str, kind: SubtestKind, label: &str) {
        info!(proto, %kind, label, "test result");
    }

    fn test_rate(&self, proto: &str, kind: SubtestKind, mbps: f64) {
        info!(proto, %kind, "rate {:.3} Mbps", mbps);
    }

    fn bbr_enabled(&self, success: bool, error: &str) {
        debug!(success, error, "bbr");
    }
}

/// Classifies a finished subtest for the result counter.
pub fn result_label(failed: bool, rate: f64) -> &'static str {
    match (failed, rate > 0.0) {
        (false, true) => "okay-with-rate",
        (false, false) => "okay-without-rate",
        (true, true) => "error-with-rate",
        (true, false) => "error-without-rate",
    }
}
