use crate::error::AdapterError;
use serde::{Deserialize, Serialize};

/// Optional printer operations a vendor implementation may or may not provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Upload,
    Start,
    Pause,
    Resume,
    Cancel,
    SendRaw,
    StatusStream,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Upload => "upload",
            Operation::Start => "start",
            Operation::Pause => "pause",
            Operation::Resume => "resume",
            Operation::Cancel => "cancel",
            Operation::SendRaw => "send_raw",
            Operation::StatusStream => "status_stream",
        }
    }
}

/// Static capability descriptor published by each adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities {
    pub upload: bool,
    pub start: bool,
    pub pause: bool,
    pub resume: bool,
    pub cancel: bool,
    pub send_raw: bool,
    pub status_stream: bool,
}

impl Capabilities {
    pub const fn all() -> Self {
        Self {
            upload: true,
            start: true,
            pause: true,
            resume: true,
            cancel: true,
            send_raw: true,
            status_stream: true,
        }
    }

    pub const fn none() -> Self {
        Self {
            upload: false,
            start: false,
            pause: false,
            resume: false,
            cancel: false,
            send_raw: false,
            status_stream: false,
        }
    }

    pub fn supports(&self, op: Operation) -> bool {
        match op {
            Operation::Upload => self.upload,
            Operation::Start => self.start,
            Operation::Pause => self.pause,
            Operation::Resume => self.resume,
            Operation::Cancel => self.cancel,
            Operation::SendRaw => self.send_raw,
            Operation::StatusStream => self.status_stream,
        }
    }

    /// `Unsupported` instead of a call into a missing operation.
    pub fn require(&self, op: Operation) -> Result<(), AdapterError> {
        if self.supports(op) {
            Ok(())
        } else {
            Err(AdapterError::Unsupported(op.as_str().to_string()))
        }
    }
}
