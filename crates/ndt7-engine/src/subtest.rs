//! One download or upload subtest over any [`Transport`].

use crate::error::SenderError;
use crate::measurer::Measurer;
use crate::observer::Observer;
use crate::ping::TickClock;
use crate::receiver::Receiver;
use crate::sender::Sender;
use crate::transport::Transport;
use ndt7_model::{ArchivalData, SessionBounds, SubtestKind};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Runs the receiver in the background and the sender in place, then
/// waits for the receiver before returning.
///
/// Once this returns no task writes to `data` any more. Only the sender's
/// failure is reported; receiver problems just shorten
/// `data.client_measurements`.
pub async fn run_subtest<T: Transport>(
    kind: SubtestKind,
    transport: T,
    scope: &CancellationToken,
    bounds: &SessionBounds,
    data: &mut ArchivalData,
    observer: Arc<dyn Observer>,
) -> Result<(), SenderError> {
    let proto = transport.protocol();
    let conn = transport.connection_info().clone();
    let (mut sink, source, stats) = transport.split();
    let clock = TickClock::new();

    let receiver = Receiver::new(source, kind, proto, clock, observer.clone());
    let receiver_task = tokio::spawn(receiver.run(scope.child_token(), *bounds));

    let measurer = Measurer::new(stats, conn, kind, bounds.sampling, observer.clone());
    let result = Sender::new(&mut sink, kind, proto, clock, observer.as_ref())
        .run(measurer, scope, bounds, data)
        .await;

    match receiver_task.await {
        Ok(client) => data.client_measurements.extend(client),
        Err(e) => warn!(error = %e, "receiver task failed"),
    }
    result
}

/// Download: the server streams load plus measurements; the client may only
/// send text reports.
pub async fn run_download<T: Transport>(
    transport: T,
    scope: &CancellationToken,
    bounds: &SessionBounds,
    data: &mut ArchivalData,
    observer: Arc<dyn Observer>,
) -> Result<(), SenderError> {
    run_subtest(SubtestKind::Download, transport, scope, bounds, data, observer).await
}

/// Upload: the client streams load, the server sends measurements only.
pub async fn run_upload<T: Transport>(
    transport: T,
    scope: &CancellationToken,
    bounds: &SessionBounds,
    data: &mut ArchivalData,
    observer: Arc<dyn Observer>,
) -> Result<(), SenderError> {
    run_subtest(SubtestKind::Upload, transport, scope, bounds, data, observer).await
}
