pub mod error;
pub mod measurer;
pub mod observer;
pub mod ping;
pub mod receiver;
pub mod results;
pub mod sender;
pub mod session;
pub mod stats;
pub mod subtest;
pub mod transport;

pub use error::{ReceiveError, ResultError, SenderError, SessionError, StatsError, TransportError};
pub use observer::{LogObserver, NoopObserver, Observer};
pub use results::{DiscardSink, JsonFileSink, ResultSink};
pub use session::{Session, SessionOutcome};
pub use subtest::{run_download, run_subtest, run_upload};
pub use transport::{StatsSource, Transport, Unit, UnitSink, UnitSource};
