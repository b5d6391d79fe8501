//! Records owned by the repositories: printers, jobs, racks, shelves, ejectors.

use crate::adapter::{Credentials, FileRef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type PrinterId = u64;
pub type JobId = u64;
pub type RackId = u64;
pub type ShelfId = u64;
pub type OttoejectId = u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrinterRecord {
    pub id: PrinterId,
    pub name: String,
    pub brand: String,
    #[serde(default)]
    pub model: String,
    pub address: String,
    #[serde(default)]
    pub credentials: Credentials,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Dispatching,
    Printing,
    AwaitingEject,
    Ejecting,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    fn rank(self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Dispatching => 1,
            JobStatus::Printing => 2,
            JobStatus::AwaitingEject => 3,
            JobStatus::Ejecting => 4,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => 5,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }

    /// Job status only moves forward; terminal states are final.
    pub fn can_advance_to(self, next: JobStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Dispatching => "DISPATCHING",
            JobStatus::Printing => "PRINTING",
            JobStatus::AwaitingEject => "AWAITING_EJECT",
            JobStatus::Ejecting => "EJECTING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_job_status() -> JobStatus {
    JobStatus::Queued
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintJob {
    pub id: JobId,
    pub printer_id: PrinterId,
    pub file: FileRef,
    #[serde(default)]
    pub ottoeject_id: Option<OttoejectId>,
    #[serde(default)]
    pub rack_id: Option<RackId>,
    /// Pins the job to one shelf instead of the lowest free one.
    #[serde(default)]
    pub shelf_id: Option<ShelfId>,
    #[serde(default)]
    pub print_height_mm: Option<f64>,
    /// Higher runs first.
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_job_status")]
    pub status: JobStatus,
    #[serde(default = "Utc::now")]
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status_message: Option<String>,
}

impl PrintJob {
    pub fn new(id: JobId, printer_id: PrinterId, file: FileRef) -> Self {
        Self {
            id,
            printer_id,
            file,
            ottoeject_id: None,
            rack_id: None,
            shelf_id: None,
            print_height_mm: None,
            priority: 0,
            status: JobStatus::Queued,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            status_message: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_rack(mut self, rack_id: RackId) -> Self {
        self.rack_id = Some(rack_id);
        self
    }

    pub fn with_shelf(mut self, shelf_id: ShelfId) -> Self {
        self.shelf_id = Some(shelf_id);
        self
    }

    pub fn with_ottoeject(mut self, ottoeject_id: OttoejectId) -> Self {
        self.ottoeject_id = Some(ottoeject_id);
        self
    }

    pub fn with_print_height(mut self, mm: f64) -> Self {
        self.print_height_mm = Some(mm);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RackRecord {
    pub id: RackId,
    pub name: String,
    /// Ejector that serves this rack.
    #[serde(default)]
    pub ottoeject_id: Option<OttoejectId>,
}

/// One storage slot. A reservation is `occupied == false` with `contents` set;
/// a stored part is `occupied == true`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shelf {
    pub id: ShelfId,
    pub rack_id: RackId,
    pub number: u32,
    pub occupied: bool,
    pub contents: Option<JobId>,
    pub clearance_mm: Option<f64>,
    pub last_modified: DateTime<Utc>,
}

impl Shelf {
    pub fn new(rack_id: RackId, id: ShelfId, number: u32) -> Self {
        Self {
            id,
            rack_id,
            number,
            occupied: false,
            contents: None,
            clearance_mm: None,
            last_modified: Utc::now(),
        }
    }

    pub fn with_clearance(mut self, mm: f64) -> Self {
        self.clearance_mm = Some(mm);
        self
    }

    pub fn is_empty(&self) -> bool {
        !self.occupied && self.contents.is_none()
    }

    pub fn is_reserved_for(&self, job_id: JobId) -> bool {
        !self.occupied && self.contents == Some(job_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OttoejectRecord {
    pub id: OttoejectId,
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_is_monotonic() {
        assert!(JobStatus::Queued.can_advance_to(JobStatus::Dispatching));
        assert!(JobStatus::Printing.can_advance_to(JobStatus::Failed));
        assert!(JobStatus::Queued.can_advance_to(JobStatus::Cancelled));
        assert!(!JobStatus::Ejecting.can_advance_to(JobStatus::Printing));
        assert!(!JobStatus::Printing.can_advance_to(JobStatus::Printing));
        assert!(!JobStatus::Completed.can_advance_to(JobStatus::Failed));
        assert!(!JobStatus::Cancelled.can_advance_to(JobStatus::Cancelled));
    }

    #[test]
    fn reservation_is_not_empty() {
        let mut shelf = Shelf::new(1, 3, 3);
        assert!(shelf.is_empty());
        shelf.contents = Some(42);
        assert!(!shelf.is_empty());
        assert!(shelf.is_reserved_for(42));
        shelf.occupied = true;
        assert!(!shelf.is_reserved_for(42));
    }

    #[test]
    fn job_deserializes_with_defaults() {
        let job: PrintJob = toml::from_str(
            r#"
            id = 7
            printer_id = 2
            file = { name = "bracket.gcode" }
            priority = 5
            "#,
        )
        .unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.priority, 5);
        assert!(job.rack_id.is_none());
    }
}
