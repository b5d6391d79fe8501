use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Coarse classification every error in the workspace maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Auth,
    Network,
    DeviceError,
    Unsupported,
    ShelfUnavailable,
    StaleCache,
}

impl ErrorKind {
    /// Transient kinds that the workflow retries within its budget.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Network | ErrorKind::DeviceError)
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum AdapterError {
    /// The adapter was closed or never authenticated.
    #[error("printer adapter is not connected")]
    NotConnected,
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("printer reported an error: {0}")]
    Device(String),
    #[error("{0} is not supported by this printer")]
    Unsupported(String),
}

impl AdapterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AdapterError::NotConnected | AdapterError::Network(_) | AdapterError::Timeout(_) => {
                ErrorKind::Network
            }
            AdapterError::Auth(_) => ErrorKind::Auth,
            AdapterError::Device(_) => ErrorKind::DeviceError,
            AdapterError::Unsupported(_) => ErrorKind::Unsupported,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_are_transient() {
        let err = AdapterError::Timeout(Duration::from_secs(3));
        assert_eq!(err.kind(), ErrorKind::Network);
        assert!(err.is_retryable());
    }

    #[test]
    fn auth_and_unsupported_are_not_retried() {
        assert!(!AdapterError::Auth("bad access code".into()).is_retryable());
        assert!(!AdapterError::Unsupported("pause".into()).is_retryable());
    }
}
