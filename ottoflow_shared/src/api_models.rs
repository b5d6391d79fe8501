//! Response bodies of the orchestrator control surface.

use crate::model::{JobId, JobStatus, OttoejectId, PrinterId, RackId, ShelfId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Live view of one workflow.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowSnapshot {
    pub run_id: Uuid,
    pub job_id: JobId,
    pub printer_id: PrinterId,
    pub ottoeject_id: Option<OttoejectId>,
    pub rack_id: Option<RackId>,
    pub shelf_id: Option<ShelfId>,
    pub state: JobStatus,
    pub retry_count: u32,
    pub started_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub progress_percent: Option<f64>,
    pub error: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProcessingStatus {
    pub enabled: bool,
    pub initialized: bool,
    pub active_workflows: usize,
    pub tick_interval_ms: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
    /// Printers holding a finished part that has no rack to go to.
    pub awaiting_bed_clear: Vec<PrinterId>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct OrchestratorStats {
    pub ticks: u64,
    pub coalesced_triggers: u64,
    pub jobs_dispatched: u64,
    pub jobs_deferred: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    pub retries: u64,
    pub printers_utilized: usize,
    pub active_workflows: usize,
    pub last_tick_ms: Option<u64>,
    pub average_tick_ms: Option<u64>,
    pub average_processing_ms: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HealthReport {
    pub status: HealthState,
    pub repository_reachable: bool,
    pub job_processing_enabled: bool,
    pub printers_total: usize,
    pub printers_online: usize,
    pub printers_reconnecting: usize,
    pub printers_offline: usize,
    pub active_workflows: usize,
    pub stale_workflows: usize,
    pub checked_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StatusResponse {
    pub initialized: bool,
    pub processing: ProcessingStatus,
    pub statistics: OrchestratorStats,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ActiveJobsResponse {
    pub active: Vec<WorkflowSnapshot>,
    /// Most recent finished workflows, newest first.
    pub recent: Vec<WorkflowSnapshot>,
}
