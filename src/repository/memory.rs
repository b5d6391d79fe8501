use async_trait::async_trait;
use chrono::Utc;
use ottoflow_shared::config::Config;
use ottoflow_shared::lock;
use ottoflow_shared::model::{
    JobId, JobStatus, PrintJob, PrinterId, PrinterRecord, RackId, RackRecord, Shelf, ShelfId,
};
use ottoflow_shared::repository::{JobRepository, PrinterRepository, RackRepository, RepositoryError};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

/// Process-local store backing all three repositories. Records every job
/// status change so callers can inspect the history.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<StoreState>,
}

#[derive(Default)]
struct StoreState {
    printers: BTreeMap<PrinterId, PrinterRecord>,
    jobs: BTreeMap<JobId, PrintJob>,
    racks: BTreeMap<RackId, RackRecord>,
    shelves: BTreeMap<RackId, Vec<Shelf>>,
    history: HashMap<JobId, Vec<JobStatus>>,
    failing_shelf_writes: u32,
    unavailable: bool,
}

impl StoreState {
    fn check_available(&self) -> Result<(), RepositoryError> {
        if self.unavailable {
            Err(RepositoryError::Unavailable("store offline".to_string()))
        } else {
            Ok(())
        }
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds printers, racks and queued jobs from configuration. Shelf ids
    /// equal shelf numbers.
    pub fn from_config(config: &Config) -> Self {
        let store = Self::new();
        for printer in &config.printers {
            store.add_printer(printer.clone());
        }
        for rack in &config.racks {
            let shelves = (1..=rack.shelves)
                .map(|number| {
                    let shelf = Shelf::new(rack.id, u64::from(number), number);
                    match rack.shelf_clearance_mm {
                        Some(mm) => shelf.with_clearance(mm),
                        None => shelf,
                    }
                })
                .collect();
            store.add_rack(
                RackRecord { id: rack.id, name: rack.name.clone(), ottoeject_id: rack.ottoeject_id },
                shelves,
            );
        }
        for job in &config.jobs {
            store.add_job(job.clone());
        }
        store
    }

    pub fn add_printer(&self, printer: PrinterRecord) {
        lock(&self.inner).printers.insert(printer.id, printer);
    }

    pub fn add_job(&self, job: PrintJob) {
        lock(&self.inner).jobs.insert(job.id, job);
    }

    pub fn add_rack(&self, rack: RackRecord, shelves: Vec<Shelf>) {
        let mut state = lock(&self.inner);
        state.shelves.insert(rack.id, shelves);
        state.racks.insert(rack.id, rack);
    }

    pub fn job(&self, job_id: JobId) -> Option<PrintJob> {
        lock(&self.inner).jobs.get(&job_id).cloned()
    }

    /// Every status a job was moved to, in order. The initial QUEUED is not included.
    pub fn status_history(&self, job_id: JobId) -> Vec<JobStatus> {
        lock(&self.inner).history.get(&job_id).cloned().unwrap_or_default()
    }

    pub fn shelf(&self, rack_id: RackId, shelf_id: ShelfId) -> Option<Shelf> {
        lock(&self.inner)
            .shelves
            .get(&rack_id)
            .and_then(|shelves| shelves.iter().find(|s| s.id == shelf_id).cloned())
    }

    /// Changes a shelf behind the cache's back, like another process would.
    pub fn overwrite_shelf(&self, rack_id: RackId, shelf_id: ShelfId, occupied: bool, contents: Option<JobId>) {
        let mut state = lock(&self.inner);
        if let Some(shelf) = state
            .shelves
            .get_mut(&rack_id)
            .and_then(|shelves| shelves.iter_mut().find(|s| s.id == shelf_id))
        {
            shelf.occupied = occupied;
            shelf.contents = contents;
            shelf.last_modified = Utc::now();
        }
    }

    /// The next `count` shelf writes fail with `Unavailable`.
    pub fn fail_next_shelf_writes(&self, count: u32) {
        lock(&self.inner).failing_shelf_writes = count;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        lock(&self.inner).unavailable = unavailable;
    }
}

#[async_trait]
impl JobRepository for InMemoryStore {
    async fn list_runnable(&self, printer_id: PrinterId) -> Result<Vec<PrintJob>, RepositoryError> {
        let state = lock(&self.inner);
        state.check_available()?;
        Ok(state
            .jobs
            .values()
            .filter(|job| job.printer_id == printer_id && job.status == JobStatus::Queued)
            .cloned()
            .collect())
    }

    async fn list_active(&self) -> Result<Vec<PrintJob>, RepositoryError> {
        let state = lock(&self.inner);
        state.check_available()?;
        Ok(state
            .jobs
            .values()
            .filter(|job| job.status != JobStatus::Queued && !job.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<PrintJob>, RepositoryError> {
        let state = lock(&self.inner);
        state.check_available()?;
        Ok(state.jobs.get(&job_id).cloned())
    }

    async fn update_status(
        &self,
        job_id: JobId,
        status: JobStatus,
        message: Option<String>,
    ) -> Result<(), RepositoryError> {
        let mut state = lock(&self.inner);
        state.check_available()?;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(RepositoryError::NotFound { entity: "job", id: job_id })?;
        if !job.status.can_advance_to(status) {
            return Err(RepositoryError::InvalidTransition { from: job.status, to: status });
        }
        job.status = status;
        if status == JobStatus::Dispatching {
            job.started_at = Some(Utc::now());
        }
        if status.is_terminal() {
            job.finished_at = Some(Utc::now());
        }
        if message.is_some() {
            job.status_message = message;
        }
        state.history.entry(job_id).or_default().push(status);
        Ok(())
    }

    async fn cancel(&self, job_id: JobId) -> Result<(), RepositoryError> {
        let current = {
            let state = lock(&self.inner);
            state.check_available()?;
            state
                .jobs
                .get(&job_id)
                .map(|job| job.status)
                .ok_or(RepositoryError::NotFound { entity: "job", id: job_id })?
        };
        if current == JobStatus::Cancelled {
            return Ok(());
        }
        self.update_status(job_id, JobStatus::Cancelled, Some("cancelled".to_string())).await
    }
}

#[async_trait]
impl RackRepository for InMemoryStore {
    async fn list_racks(&self) -> Result<Vec<RackRecord>, RepositoryError> {
        let state = lock(&self.inner);
        state.check_available()?;
        Ok(state.racks.values().cloned().collect())
    }

    async fn get_shelves(&self, rack_id: RackId) -> Result<Vec<Shelf>, RepositoryError> {
        let state = lock(&self.inner);
        state.check_available()?;
        state
            .shelves
            .get(&rack_id)
            .cloned()
            .ok_or(RepositoryError::NotFound { entity: "rack", id: rack_id })
    }

    async fn set_shelf(
        &self,
        rack_id: RackId,
        shelf_id: ShelfId,
        occupied: bool,
        contents: Option<JobId>,
    ) -> Result<Shelf, RepositoryError> {
        let mut state = lock(&self.inner);
        state.check_available()?;
        if state.failing_shelf_writes > 0 {
            state.failing_shelf_writes -= 1;
            return Err(RepositoryError::Unavailable("injected shelf write failure".to_string()));
        }
        let shelf = state
            .shelves
            .get_mut(&rack_id)
            .ok_or(RepositoryError::NotFound { entity: "rack", id: rack_id })?
            .iter_mut()
            .find(|s| s.id == shelf_id)
            .ok_or(RepositoryError::NotFound { entity: "shelf", id: shelf_id })?;
        shelf.occupied = occupied;
        shelf.contents = contents;
        shelf.last_modified = Utc::now();
        Ok(shelf.clone())
    }
}

#[async_trait]
impl PrinterRepository for InMemoryStore {
    async fn list_printers(&self) -> Result<Vec<PrinterRecord>, RepositoryError> {
        let state = lock(&self.inner);
        state.check_available()?;
        Ok(state.printers.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ottoflow_shared::FileRef;

    #[tokio::test]
    async fn rejects_backward_transitions() {
        let store = InMemoryStore::new();
        store.add_job(PrintJob::new(1, 1, FileRef::remote("a.gcode")));
        store.update_status(1, JobStatus::Dispatching, None).await.unwrap();
        store.update_status(1, JobStatus::Printing, None).await.unwrap();
        let err = store.update_status(1, JobStatus::Dispatching, None).await.unwrap_err();
        assert_eq!(
            err,
            RepositoryError::InvalidTransition { from: JobStatus::Printing, to: JobStatus::Dispatching }
        );
        assert_eq!(store.status_history(1), vec![JobStatus::Dispatching, JobStatus::Printing]);
        assert!(store.job(1).unwrap().started_at.is_some());
    }

    #[tokio::test]
    async fn cancel_is_idempotent_but_final() {
        let store = InMemoryStore::new();
        store.add_job(PrintJob::new(1, 1, FileRef::remote("a.gcode")));
        store.cancel(1).await.unwrap();
        store.cancel(1).await.unwrap();
        assert_eq!(store.job(1).unwrap().status, JobStatus::Cancelled);
        assert!(store.update_status(1, JobStatus::Dispatching, None).await.is_err());
    }

    #[tokio::test]
    async fn seeded_from_config() {
        let config = Config::parse(
            r#"
[[printers]]
id = 1
name = "p1"
brand = "simulated"
address = "sim"

[[ottoejects]]
id = 1
name = "e1"
address = "sim"

[[racks]]
id = 1
name = "rack"
ottoeject_id = 1
shelves = 4
shelf_clearance_mm = 120.0

[[jobs]]
id = 10
printer_id = 1
rack_id = 1
file = { name = "gear.gcode" }
"#,
        )
        .unwrap();
        let store = InMemoryStore::from_config(&config);
        let shelves = store.get_shelves(1).await.unwrap();
        assert_eq!(shelves.len(), 4);
        assert_eq!(shelves[3].number, 4);
        assert_eq!(shelves[0].clearance_mm, Some(120.0));
        assert_eq!(store.list_runnable(1).await.unwrap().len(), 1);
    }
}
