//! Ottoeject (robotic part remover) client contract.

use crate::error::ErrorKind;
use crate::model::OttoejectId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EjectorState {
    Idle,
    Busy,
    Error,
    Offline,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum MacroError {
    #[error("ottoeject {0} is not registered")]
    UnknownDevice(OttoejectId),
    #[error("ottoeject unreachable: {0}")]
    Network(String),
    #[error("macro {name} failed: {reason}")]
    Failed { name: String, reason: String },
    #[error("ottoeject did not finish within {0:?}")]
    Timeout(Duration),
}

impl MacroError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MacroError::UnknownDevice(_) => ErrorKind::Unsupported,
            MacroError::Network(_) | MacroError::Timeout(_) => ErrorKind::Network,
            MacroError::Failed { .. } => ErrorKind::DeviceError,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

#[async_trait]
pub trait OttoejectClient: Send + Sync {
    /// Runs one named macro. Returns once the device accepted and finished it,
    /// or with the failure it reported.
    async fn execute_macro(&self, ottoeject_id: OttoejectId, name: &str) -> Result<(), MacroError>;

    async fn get_status(&self, ottoeject_id: OttoejectId) -> Result<EjectorState, MacroError>;
}
