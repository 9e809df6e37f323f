use crate::error::ResultError;
use chrono::{DateTime, Utc};
use ndt7_model::{Ndt7Result, SubtestKind};
use std::fs;
use std::path::{Path, PathBuf};

/// Where finished subtest records go.
pub trait ResultSink: Send + Sync {
    fn write(&self, kind: SubtestKind, result: &Ndt7Result) -> Result<(), ResultError>;
}

/// Writes one pretty-printed JSON file per subtest under a dated directory.
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    data_dir: PathBuf,
}

impl JsonFileSink {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// `<data_dir>/ndt7/YYYY/MM/DD/ndt7-<kind>-<timestamp>.<uuid>.json`
    pub fn path_for(&self, kind: SubtestKind, uuid: &str, at: DateTime<Utc>) -> PathBuf {
        self.data_dir
            .join("ndt7")
            .join(at.format("%Y/%m/%d").to_string())
            .join(format!(
                "ndt7-{}-{}.{}.json",
                kind,
                at.format("%Y%m%dT%H%M%S%.9fZ"),
                uuid
            ))
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

impl ResultSink for JsonFileSink {
    fn write(&self, kind: SubtestKind, result: &Ndt7Result) -> Result<(), ResultError> {
        let data = match kind {
            SubtestKind::Download => result.download.as_ref(),
            SubtestKind::Upload => result.upload.as_ref(),
        };
        let uuid = data.map(|d| d.uuid()).unwrap_or_default();
        let path = self.path_for(kind, uuid, Utc::now());
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|source| ResultError::Create {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(result)?;
        fs::write(&path, json).map_err(|source| ResultError::Create { path, source })
    }
}

/// Drops every result.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardSink;

impl ResultSink for DiscardSink {
    fn write(&self, _kind: SubtestKind, _result: &Ndt7Result) -> Result<(), ResultError> {
        Ok(())
    }
}
