use crate::measurement::Measurement;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Free-form metadata pair (client query parameters, server deployment info).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NameValue {
    pub name: String,
    pub value: String,
}

impl NameValue {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Everything collected during one subtest.
///
/// `server_measurements` is written only by the sender and
/// `client_measurements` only by the receiver; both are stable once the
/// subtest call has returned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ArchivalData {
    #[serde(rename = "UUID")]
    uuid: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub server_measurements: Vec<Measurement>,
    pub client_measurements: Vec<Measurement>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub client_metadata: Vec<NameValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub server_metadata: Vec<NameValue>,
}

impl ArchivalData {
    pub fn new(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            ..Default::default()
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }
}

/// The record handed to result persistence once a subtest is over.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Ndt7Result {
    pub version: String,
    #[serde(rename = "ClientIP")]
    pub client_ip: String,
    pub client_port: u16,
    #[serde(rename = "ServerIP")]
    pub server_ip: String,
    pub server_port: u16,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download: Option<ArchivalData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload: Option<ArchivalData>,
}
