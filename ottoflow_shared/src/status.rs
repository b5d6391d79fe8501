//! Normalized printer telemetry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Vendor-independent printer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PrintState {
    Idle,
    Preparing,
    Running,
    Paused,
    Completed,
    Error,
    Unknown,
    Offline,
}

impl PrintState {
    /// A print is underway on the device.
    pub fn is_active(self) -> bool {
        matches!(self, PrintState::Preparing | PrintState::Running | PrintState::Paused)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PrintState::Completed | PrintState::Error)
    }

    /// The printer can take a new job in this state.
    pub fn accepts_new_job(self) -> bool {
        matches!(self, PrintState::Idle | PrintState::Completed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PrintState::Idle => "IDLE",
            PrintState::Preparing => "PREPARING",
            PrintState::Running => "RUNNING",
            PrintState::Paused => "PAUSED",
            PrintState::Completed => "COMPLETED",
            PrintState::Error => "ERROR",
            PrintState::Unknown => "UNKNOWN",
            PrintState::Offline => "OFFLINE",
        }
    }
}

impl fmt::Display for PrintState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Temperatures in °C. Any sensor the vendor does not report stays `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Temperatures {
    pub nozzle: Option<f64>,
    pub nozzle_target: Option<f64>,
    pub bed: Option<f64>,
    pub bed_target: Option<f64>,
    pub chamber: Option<f64>,
}

/// Immutable snapshot of one printer observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub state: PrintState,
    pub progress_percent: Option<f64>,
    pub remaining_minutes: Option<u32>,
    #[serde(default)]
    pub temperatures: Temperatures,
    pub current_file: Option<String>,
    pub error_code: Option<String>,
    /// Vendor payload, kept for diagnostics only.
    #[serde(default)]
    pub raw: serde_json::Value,
    pub observed_at: DateTime<Utc>,
}

impl DeviceStatus {
    pub fn new(state: PrintState) -> Self {
        Self {
            state,
            progress_percent: None,
            remaining_minutes: None,
            temperatures: Temperatures::default(),
            current_file: None,
            error_code: None,
            raw: serde_json::Value::Null,
            observed_at: Utc::now(),
        }
    }

    pub fn offline() -> Self {
        Self::new(PrintState::Offline)
    }

    pub fn unknown() -> Self {
        Self::new(PrintState::Unknown)
    }

    pub fn with_progress(mut self, percent: f64) -> Self {
        self.progress_percent = Some(percent.clamp(0.0, 100.0));
        self
    }

    pub fn with_file(mut self, name: impl Into<String>) -> Self {
        self.current_file = Some(name.into());
        self
    }

    pub fn with_error_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }

    /// State after applying the ambiguity rule: a reported error code wins over
    /// whatever `state` says, including COMPLETED.
    pub fn effective_state(&self) -> PrintState {
        if self.error_code.is_some() {
            PrintState::Error
        } else {
            self.state
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.effective_state().is_terminal()
    }

    pub fn is_fresh(&self, max_age: Duration) -> bool {
        match (Utc::now() - self.observed_at).to_std() {
            Ok(age) => age <= max_age,
            // observed_at in the future: clock skew, treat as fresh
            Err(_) => true,
        }
    }
}
