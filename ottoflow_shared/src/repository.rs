//! Persistence collaborators. Storage is owned elsewhere; the orchestrator
//! only talks to these traits.

use crate::error::ErrorKind;
use crate::model::{
    JobId, JobStatus, PrintJob, PrinterId, PrinterRecord, RackId, RackRecord, Shelf, ShelfId,
};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RepositoryError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: u64 },
    #[error("invalid job status transition {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
    #[error("repository unavailable: {0}")]
    Unavailable(String),
}

impl RepositoryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RepositoryError::NotFound { .. } | RepositoryError::InvalidTransition { .. } => {
                ErrorKind::StaleCache
            }
            RepositoryError::Unavailable(_) => ErrorKind::Network,
        }
    }
}

#[async_trait]
pub trait JobRepository: Send + Sync {
    /// QUEUED jobs targeting the printer, in no particular order.
    async fn list_runnable(&self, printer_id: PrinterId) -> Result<Vec<PrintJob>, RepositoryError>;

    /// Jobs past QUEUED but not yet terminal.
    async fn list_active(&self) -> Result<Vec<PrintJob>, RepositoryError>;

    async fn get(&self, job_id: JobId) -> Result<Option<PrintJob>, RepositoryError>;

    /// Rejects transitions that would move the job backwards.
    async fn update_status(
        &self,
        job_id: JobId,
        status: JobStatus,
        message: Option<String>,
    ) -> Result<(), RepositoryError>;

    async fn cancel(&self, job_id: JobId) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait RackRepository: Send + Sync {
    async fn list_racks(&self) -> Result<Vec<RackRecord>, RepositoryError>;

    async fn get_shelves(&self, rack_id: RackId) -> Result<Vec<Shelf>, RepositoryError>;

    async fn set_shelf(
        &self,
        rack_id: RackId,
        shelf_id: ShelfId,
        occupied: bool,
        contents: Option<JobId>,
    ) -> Result<Shelf, RepositoryError>;
}

#[async_trait]
pub trait PrinterRepository: Send + Sync {
    async fn list_printers(&self) -> Result<Vec<PrinterRecord>, RepositoryError>;
}
