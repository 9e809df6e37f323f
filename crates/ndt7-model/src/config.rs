use crate::archival::NameValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("default runtime {default:?} exceeds max runtime {max:?}")]
    RuntimeOrder { default: Duration, max: Duration },
    #[error("sampling intervals must satisfy 0 < min <= expected <= max (got {min:?}/{expected:?}/{max:?})")]
    SamplingOrder {
        min: Duration,
        expected: Duration,
        max: Duration,
    },
    #[error("max message size must be positive")]
    ZeroMessageSize,
}

/// Bounds of the randomized sampling interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingConfig {
    pub min: Duration,
    pub expected: Duration,
    pub max: Duration,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(25),
            expected: Duration::from_millis(250),
            max: Duration::from_millis(625),
        }
    }
}

impl SamplingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min.is_zero() || self.min > self.expected || self.expected > self.max {
            return Err(ConfigError::SamplingOrder {
                min: self.min,
                expected: self.expected,
                max: self.max,
            });
        }
        Ok(())
    }
}

/// Time and size limits shared by every actor of a subtest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionBounds {
    /// Hard ceiling for the whole subtest.
    pub max_runtime: Duration,
    /// How long the measurer keeps sampling.
    pub default_runtime: Duration,
    pub max_message_size: usize,
    /// Per-accept timeout of the stream based receiver.
    pub accept_timeout: Duration,
    pub sampling: SamplingConfig,
}

impl Default for SessionBounds {
    fn default() -> Self {
        Self {
            max_runtime: Duration::from_secs(15),
            default_runtime: Duration::from_secs(10),
            max_message_size: 1 << 24,
            accept_timeout: Duration::from_secs(5),
            sampling: SamplingConfig::default(),
        }
    }
}

impl SessionBounds {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_runtime > self.max_runtime {
            return Err(ConfigError::RuntimeOrder {
                default: self.default_runtime,
                max: self.max_runtime,
            });
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::ZeroMessageSize);
        }
        self.sampling.validate()
    }
}

/// Partial bounds, in milliseconds, as found in config files and on the
/// command line.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BoundsOverride {
    pub max_runtime_ms: Option<u64>,
    pub default_runtime_ms: Option<u64>,
    pub max_message_size: Option<usize>,
    pub accept_timeout_ms: Option<u64>,
    pub min_sampling_ms: Option<u64>,
    pub expected_sampling_ms: Option<u64>,
    pub max_sampling_ms: Option<u64>,
}

impl BoundsOverride {
    pub fn apply_to(&self, bounds: &mut SessionBounds) {
        if let Some(v) = self.max_runtime_ms {
            bounds.max_runtime = Duration::from_millis(v);
        }
        if let Some(v) = self.default_runtime_ms {
            bounds.default_runtime = Duration::from_millis(v);
        }
        if let Some(v) = self.max_message_size {
            bounds.max_message_size = v;
        }
        if let Some(v) = self.accept_timeout_ms {
            bounds.accept_timeout = Duration::from_millis(v);
        }
        if let Some(v) = self.min_sampling_ms {
            bounds.sampling.min = Duration::from_millis(v);
        }
        if let Some(v) = self.expected_sampling_ms {
            bounds.sampling.expected = Duration::from_millis(v);
        }
        if let Some(v) = self.max_sampling_ms {
            bounds.sampling.max = Duration::from_millis(v);
        }
    }

    /// Fields set in `other` win.
    pub fn merge(&mut self, other: &BoundsOverride) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if other.$field.is_some() {
                    self.$field = other.$field;
                })*
            };
        }
        take!(
            max_runtime_ms,
            default_runtime_ms,
            max_message_size,
            accept_timeout_ms,
            min_sampling_ms,
            expected_sampling_ms,
            max_sampling_ms
        );
    }
}

/// Server process configuration, loaded from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub ws_addr: Option<SocketAddr>,
    pub quic_addr: Option<SocketAddr>,
    /// PEM certificate chain for the QUIC listener.
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub data_dir: PathBuf,
    pub server_metadata: BTreeMap<String, String>,
    pub bounds: BoundsOverride,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ws_addr: Some(SocketAddr::from(([0, 0, 0, 0], 8080))),
            quic_addr: None,
            cert: None,
            key: None,
            data_dir: PathBuf::from("data"),
            server_metadata: BTreeMap::new(),
            bounds: BoundsOverride::default(),
        }
    }
}

impl ServerConfig {
    pub fn session_bounds(&self) -> Result<SessionBounds, ConfigError> {
        let mut bounds = SessionBounds::default();
        self.bounds.apply_to(&mut bounds);
        bounds.validate()?;
        Ok(bounds)
    }

    pub fn metadata(&self) -> Vec<NameValue> {
        self.server_metadata
            .iter()
            .map(|(k, v)| NameValue::new(k.clone(), v.clone()))
            .collect()
    }
}
