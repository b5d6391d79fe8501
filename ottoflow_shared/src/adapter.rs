//! Capability-set contract every vendor printer implementation satisfies.

use crate::capabilities::Capabilities;
use crate::error::AdapterError;
use crate::status::DeviceStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::pin::Pin;

/// Infinite sequence of status snapshots. Ends when the adapter is closed or the
/// device link drops; it is not restartable, callers ask for a new one.
pub type StatusStream = Pin<Box<dyn Stream<Item = DeviceStatus> + Send>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub access_code: Option<String>,
    #[serde(default)]
    pub serial: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

/// A print file. `local_path` is set when the file still has to be uploaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRef {
    pub name: String,
    #[serde(default)]
    pub local_path: Option<PathBuf>,
}

impl FileRef {
    pub fn remote(name: impl Into<String>) -> Self {
        Self { name: name.into(), local_path: None }
    }

    pub fn local(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self { name: name.into(), local_path: Some(path.into()) }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StartOptions {
    pub plate_index: Option<u32>,
    pub job_id: Option<u64>,
}

/// Returned by a successful `start`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobHandle {
    pub file_name: String,
    pub remote_id: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl JobHandle {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self { file_name: file_name.into(), remote_id: None, started_at: Utc::now() }
    }
}

#[async_trait]
pub trait PrinterAdapter: Send + Sync {
    /// Vendor tag used in logs.
    fn vendor(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    fn is_connected(&self) -> bool;

    /// Opens (or re-opens) the session. Also the reconnect entry point.
    async fn authenticate(&self, credentials: &Credentials) -> Result<(), AdapterError>;

    async fn get_status(&self) -> Result<DeviceStatus, AdapterError>;

    async fn status_stream(&self) -> Result<StatusStream, AdapterError>;

    async fn upload(&self, _file: &FileRef) -> Result<(), AdapterError> {
        Err(AdapterError::Unsupported("upload".to_string()))
    }

    async fn start(&self, file: &FileRef, options: &StartOptions) -> Result<JobHandle, AdapterError>;

    async fn pause(&self) -> Result<(), AdapterError> {
        Err(AdapterError::Unsupported("pause".to_string()))
    }

    async fn resume(&self) -> Result<(), AdapterError> {
        Err(AdapterError::Unsupported("resume".to_string()))
    }

    async fn cancel(&self) -> Result<(), AdapterError> {
        Err(AdapterError::Unsupported("cancel".to_string()))
    }

    async fn send_raw(&self, _command: &str) -> Result<(), AdapterError> {
        Err(AdapterError::Unsupported("send_raw".to_string()))
    }

    /// Idempotent. Ends any open status stream.
    async fn close(&self);
}
