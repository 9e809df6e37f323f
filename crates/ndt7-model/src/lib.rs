pub mod archival;
pub mod config;
pub mod measurement;
pub mod protocol;

pub use archival::{ArchivalData, NameValue, Ndt7Result};
pub use config::{BoundsOverride, ConfigError, SamplingConfig, ServerConfig, SessionBounds};
pub use measurement::{AppInfo, BbrInfo, ConnectionInfo, Measurement, Origin, QuicInfo, TcpInfo};
pub use protocol::SubtestKind;
