// ottoflow_shared: value types and device traits shared by the orchestrator, the simulator and tests

pub mod adapter;
pub mod api_models;
pub mod backoff;
pub mod capabilities;
pub mod config;
pub mod error;
pub mod model;
pub mod ottoeject;
pub mod repository;
pub mod status;

pub use adapter::{Credentials, FileRef, JobHandle, PrinterAdapter, StartOptions, StatusStream};
pub use capabilities::{Capabilities, Operation};
pub use error::{AdapterError, ErrorKind};
pub use status::{DeviceStatus, PrintState, Temperatures};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks a std mutex, recovering the guard if a previous holder panicked.
///
/// Every guarded structure in the workspace stays internally consistent between
/// statements, so a poisoned lock carries no torn state.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
