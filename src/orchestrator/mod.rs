//! Workflow orchestrator: the control loop that pairs idle printers with
//! queued jobs and drives each job through print, eject and shelving.
//!
//! Each printer has at most one workflow. The claim is a test-and-set on the
//! workflow map and is released when the workflow's task lets go of its
//! [`PrinterClaim`].

pub mod macros;
mod stats;
mod workflow;

use crate::connection::{ConnectionManager, InitReport, LinkState};
use crate::rack_cache::{CacheError, RackCache, ShelfCriteria};
use chrono::Utc;
use ottoflow_shared::api_models::{
    HealthReport, HealthState, OrchestratorStats, ProcessingStatus, WorkflowSnapshot,
};
use ottoflow_shared::config::OrchestratorConfig;
use ottoflow_shared::model::{
    JobId, JobStatus, OttoejectId, PrintJob, PrinterId, PrinterRecord, RackId, RackRecord, Shelf,
};
use ottoflow_shared::ottoeject::OttoejectClient;
use ottoflow_shared::repository::{JobRepository, PrinterRepository, RackRepository, RepositoryError};
use ottoflow_shared::{lock, ErrorKind};
use serde::Serialize;
use stats::StatsCollector;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;
use workflow::WorkflowRun;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("orchestrator has not been initialized")]
    NotInitialized,
    #[error("orchestrator is shutting down")]
    ShuttingDown,
    #[error("job {0} not found")]
    JobNotFound(JobId),
    #[error("job {job_id} already finished as {status}")]
    AlreadyFinished { job_id: JobId, status: JobStatus },
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::NotInitialized | OrchestratorError::ShuttingDown => ErrorKind::Unsupported,
            OrchestratorError::JobNotFound(_) | OrchestratorError::AlreadyFinished { .. } => {
                ErrorKind::StaleCache
            }
            OrchestratorError::Repository(e) => e.kind(),
            OrchestratorError::Cache(e) => e.kind(),
        }
    }
}

/// What `cancel_job` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CancelDisposition {
    /// The job was still queued and is now CANCELLED.
    Cancelled,
    /// The running workflow was told to stop; it finishes as CANCELLED.
    Requested,
    /// The ejector is mid-sequence. The sequence runs to its end first.
    Deferred,
}

/// Collaborators the orchestrator is built from.
pub struct OrchestratorParts {
    pub config: OrchestratorConfig,
    pub connections: Arc<ConnectionManager>,
    pub rack_cache: Arc<RackCache>,
    pub jobs: Arc<dyn JobRepository>,
    pub printers: Arc<dyn PrinterRepository>,
    pub racks: Arc<dyn RackRepository>,
    pub ottoeject: Arc<dyn OttoejectClient>,
}

struct WorkflowSlot {
    run_id: Uuid,
    snapshot: WorkflowSnapshot,
    cancel_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
    updated: Instant,
}

pub(crate) struct Inner {
    config: OrchestratorConfig,
    connections: Arc<ConnectionManager>,
    rack_cache: Arc<RackCache>,
    jobs: Arc<dyn JobRepository>,
    printers: Arc<dyn PrinterRepository>,
    racks: Arc<dyn RackRepository>,
    ottoeject: Arc<dyn OttoejectClient>,
    printer_records: Mutex<HashMap<PrinterId, PrinterRecord>>,
    rack_records: Mutex<HashMap<RackId, RackRecord>>,
    workflows: Mutex<HashMap<PrinterId, WorkflowSlot>>,
    ejector_locks: Mutex<HashMap<OttoejectId, Arc<tokio::sync::Mutex<()>>>>,
    awaiting_bed_clear: Mutex<BTreeSet<PrinterId>>,
    history: Mutex<VecDeque<WorkflowSnapshot>>,
    stats: Mutex<StatsCollector>,
    enabled: AtomicBool,
    initialized: AtomicBool,
    closed: AtomicBool,
    tick_lock: tokio::sync::Mutex<()>,
    shutdown_tx: broadcast::Sender<()>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn ejector_lock(&self, ottoeject_id: OttoejectId) -> Arc<tokio::sync::Mutex<()>> {
        lock(&self.ejector_locks).entry(ottoeject_id).or_default().clone()
    }

    fn printer_record(&self, printer_id: PrinterId) -> Option<PrinterRecord> {
        lock(&self.printer_records).get(&printer_id).cloned()
    }

    fn processing_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }
}

/// Exclusive right to drive one printer. Dropping it frees the printer and
/// files the workflow's last snapshot into the history.
pub(crate) struct PrinterClaim {
    inner: Arc<Inner>,
    printer_id: PrinterId,
    run_id: Uuid,
    keep_history: bool,
}

impl PrinterClaim {
    pub fn printer_id(&self) -> PrinterId {
        self.printer_id
    }

    pub fn update(&self, apply: impl FnOnce(&mut WorkflowSnapshot)) {
        let mut workflows = lock(&self.inner.workflows);
        if let Some(slot) = workflows.get_mut(&self.printer_id) {
            if slot.run_id == self.run_id {
                apply(&mut slot.snapshot);
                slot.snapshot.last_update = Utc::now();
                slot.updated = Instant::now();
            }
        }
    }

    /// Releases the printer without recording a workflow, for dispatches that
    /// never got going.
    fn abandon(mut self) {
        self.keep_history = false;
    }
}

impl Drop for PrinterClaim {
    fn drop(&mut self) {
        let removed = {
            let mut workflows = lock(&self.inner.workflows);
            match workflows.get(&self.printer_id) {
                Some(slot) if slot.run_id == self.run_id => workflows.remove(&self.printer_id),
                _ => None,
            }
        };
        if let (true, Some(slot)) = (self.keep_history, removed) {
            let mut history = lock(&self.inner.history);
            history.push_front(slot.snapshot);
            history.truncate(self.inner.config.history_len);
        }
    }
}

/// Highest priority first, then oldest submission, then lowest id.
pub fn select_next(jobs: Vec<PrintJob>) -> Option<PrintJob> {
    jobs.into_iter().filter(|job| job.status == JobStatus::Queued).min_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.submitted_at.cmp(&b.submitted_at))
            .then(a.id.cmp(&b.id))
    })
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(parts: OrchestratorParts) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(Inner {
                config: parts.config,
                connections: parts.connections,
                rack_cache: parts.rack_cache,
                jobs: parts.jobs,
                printers: parts.printers,
                racks: parts.racks,
                ottoeject: parts.ottoeject,
                printer_records: Mutex::new(HashMap::new()),
                rack_records: Mutex::new(HashMap::new()),
                workflows: Mutex::new(HashMap::new()),
                ejector_locks: Mutex::new(HashMap::new()),
                awaiting_bed_clear: Mutex::new(BTreeSet::new()),
                history: Mutex::new(VecDeque::new()),
                stats: Mutex::new(StatsCollector::default()),
                enabled: AtomicBool::new(false),
                initialized: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                tick_lock: tokio::sync::Mutex::new(()),
                shutdown_tx,
                loop_handle: Mutex::new(None),
            }),
        }
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.inner.connections
    }

    /// Loads printers and racks, opens printer sessions and recovers from a
    /// previous run: jobs left mid-workflow are failed and their shelf
    /// reservations released.
    pub async fn initialize(&self) -> Result<InitReport, OrchestratorError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(OrchestratorError::ShuttingDown);
        }
        let printers = self.inner.printers.list_printers().await?;
        let racks = self.inner.racks.list_racks().await?;
        *lock(&self.inner.printer_records) = printers.iter().map(|p| (p.id, p.clone())).collect();
        *lock(&self.inner.rack_records) = racks.into_iter().map(|r| (r.id, r)).collect();

        let report = self.inner.connections.initialize(&printers).await;

        let interrupted = self.inner.jobs.list_active().await?;
        for job in &interrupted {
            tracing::warn!(job_id = job.id, printer_id = job.printer_id, "failing job interrupted by restart");
            if let Err(e) = self
                .inner
                .jobs
                .update_status(job.id, JobStatus::Failed, Some("interrupted by orchestrator restart".to_string()))
                .await
            {
                tracing::error!(job_id = job.id, "could not fail interrupted job: {}", e);
            }
        }
        let released = self.inner.rack_cache.release_orphaned(&HashSet::new()).await?;
        if released > 0 {
            tracing::info!(released, "released orphaned shelf reservations");
        }

        self.inner.initialized.store(true, Ordering::SeqCst);
        self.inner.enabled.store(self.inner.config.start_enabled, Ordering::SeqCst);
        tracing::info!(
            printers = printers.len(),
            online = report.online.len(),
            enabled = self.inner.config.start_enabled,
            "orchestrator initialized"
        );
        Ok(report)
    }

    /// Spawns the control loop. It ticks every `tick_interval` until shutdown.
    pub fn start(&self) -> Result<(), OrchestratorError> {
        if !self.inner.initialized.load(Ordering::SeqCst) {
            return Err(OrchestratorError::NotInitialized);
        }
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(OrchestratorError::ShuttingDown);
        }
        let mut handle = lock(&self.inner.loop_handle);
        if handle.is_some() {
            return Ok(());
        }
        let orchestrator = self.clone();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let period = self.inner.config.tick_interval();
        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        orchestrator.tick().await;
                    }
                }
            }
            tracing::debug!("control loop stopped");
        }));
        tracing::info!(tick_ms = period.as_millis() as u64, "control loop started");
        Ok(())
    }

    /// Stops the loop, gives running workflows `shutdown_grace` to finish,
    /// aborts the rest and closes every printer session.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("orchestrator shutting down");
        let _ = self.inner.shutdown_tx.send(());
        let handle = lock(&self.inner.loop_handle).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let deadline = tokio::time::Instant::now() + self.inner.config.shutdown_grace();
        while self.active_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        let leftover: Vec<JoinHandle<()>> = lock(&self.inner.workflows)
            .values_mut()
            .filter_map(|slot| slot.handle.take())
            .collect();
        if !leftover.is_empty() {
            tracing::warn!(count = leftover.len(), "aborting workflows still running at shutdown");
        }
        for handle in leftover {
            handle.abort();
            let _ = handle.await;
        }
        self.inner.connections.shutdown().await;
        tracing::info!("orchestrator stopped");
    }

    /// One pass of the control loop. Returns false when another pass was
    /// already running and this one was folded into it.
    pub async fn tick(&self) -> bool {
        let Ok(_guard) = self.inner.tick_lock.try_lock() else {
            lock(&self.inner.stats).record_coalesced();
            tracing::debug!("tick already running, coalesced");
            return false;
        };
        let started = Instant::now();
        self.warn_stale_workflows();
        if self.inner.processing_enabled() {
            // Printers are polled side by side so a hung one only holds up itself.
            let printer_ids = self.inner.connections.printer_ids();
            let attempts = printer_ids.iter().map(|&printer_id| self.try_dispatch(printer_id));
            let results = futures_util::future::join_all(attempts).await;
            for (printer_id, result) in printer_ids.into_iter().zip(results) {
                if let Err(e) = result {
                    tracing::error!(printer_id, kind = ?e.kind(), "dispatch failed: {}", e);
                }
            }
        }
        lock(&self.inner.stats).record_tick(started.elapsed());
        true
    }

    fn warn_stale_workflows(&self) {
        let limit = self.inner.config.stale_workflow_after();
        for slot in lock(&self.inner.workflows).values() {
            if slot.updated.elapsed() > limit {
                tracing::warn!(
                    printer_id = slot.snapshot.printer_id,
                    job_id = slot.snapshot.job_id,
                    state = %slot.snapshot.state,
                    "workflow has not progressed for {:?}",
                    slot.updated.elapsed()
                );
            }
        }
    }

    fn stale_count(&self) -> usize {
        let limit = self.inner.config.stale_workflow_after();
        lock(&self.inner.workflows).values().filter(|slot| slot.updated.elapsed() > limit).count()
    }

    fn active_count(&self) -> usize {
        lock(&self.inner.workflows).len()
    }

    /// Starts the best queued job on one printer if the printer is free.
    /// Returns the dispatched job.
    pub(crate) async fn try_dispatch(&self, printer_id: PrinterId) -> Result<Option<JobId>, OrchestratorError> {
        let inner = &self.inner;
        if !inner.processing_enabled() {
            return Ok(None);
        }
        if lock(&inner.workflows).contains_key(&printer_id) {
            return Ok(None);
        }
        if lock(&inner.awaiting_bed_clear).contains(&printer_id) {
            tracing::debug!(printer_id, "bed not cleared, skipping");
            return Ok(None);
        }
        if inner.connections.link_state(printer_id) == LinkState::Offline {
            return Ok(None);
        }
        let status = inner.connections.get_status(printer_id).await;
        if !status.effective_state().accepts_new_job() {
            tracing::debug!(printer_id, state = %status.effective_state(), "printer not ready for a job");
            return Ok(None);
        }
        let Some(printer) = inner.printer_record(printer_id) else {
            return Ok(None);
        };
        let Some(job) = select_next(inner.jobs.list_runnable(printer_id).await?) else {
            return Ok(None);
        };

        let ottoeject_id = match job.rack_id {
            Some(rack_id) => match self.ottoeject_for(&job, rack_id).await? {
                Some(id) => Some(id),
                None => {
                    tracing::error!(job_id = job.id, rack_id, "no ottoeject serves the job's rack");
                    inner
                        .jobs
                        .update_status(job.id, JobStatus::Failed, Some(format!("rack {} has no ottoeject", rack_id)))
                        .await?;
                    lock(&inner.stats).record_finished(JobStatus::Failed, std::time::Duration::ZERO);
                    return Ok(None);
                }
            },
            None => job.ottoeject_id,
        };

        let Some((claim, cancel_rx)) = self.claim(&job, ottoeject_id) else {
            return Ok(None);
        };

        let shelf = match job.rack_id {
            Some(rack_id) => match self.reserve_shelf(&job, rack_id).await {
                Ok(shelf) => Some(shelf),
                Err(e) => {
                    lock(&inner.stats).record_deferred();
                    tracing::warn!(job_id = job.id, printer_id, rack_id, kind = ?e.kind(), "job deferred: {}", e);
                    claim.abandon();
                    return Ok(None);
                }
            },
            None => None,
        };

        if let Err(e) = inner.jobs.update_status(job.id, JobStatus::Dispatching, None).await {
            if let Some(shelf) = &shelf {
                if let Err(release) = inner.rack_cache.release(shelf.rack_id, shelf.id, job.id).await {
                    tracing::warn!(job_id = job.id, "releasing shelf after failed dispatch: {}", release);
                }
            }
            claim.abandon();
            return Err(e.into());
        }
        claim.update(|snapshot| snapshot.shelf_id = shelf.as_ref().map(|s| s.id));
        lock(&inner.stats).record_dispatch(printer_id);
        tracing::info!(
            job_id = job.id,
            printer_id,
            priority = job.priority,
            shelf = ?shelf.as_ref().map(|s| s.number),
            "job dispatched"
        );

        let job_id = job.id;
        let run_id = claim.run_id;
        let run = WorkflowRun::new(self.clone(), claim, cancel_rx, job, printer, ottoeject_id, shelf);
        let handle = tokio::spawn(run.execute());
        if let Some(slot) = lock(&inner.workflows).get_mut(&printer_id) {
            if slot.run_id == run_id {
                slot.handle = Some(handle);
            }
        }
        Ok(Some(job_id))
    }

    /// Boxed so a finished workflow can dispatch the printer's next job from
    /// inside its own task.
    pub(crate) fn dispatch_next(&self, printer_id: PrinterId) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let orchestrator = self.clone();
        Box::pin(async move {
            if let Err(e) = orchestrator.try_dispatch(printer_id).await {
                tracing::warn!(printer_id, "dispatching next job failed: {}", e);
            }
        })
    }

    async fn ottoeject_for(&self, job: &PrintJob, rack_id: RackId) -> Result<Option<OttoejectId>, OrchestratorError> {
        if job.ottoeject_id.is_some() {
            return Ok(job.ottoeject_id);
        }
        let known = lock(&self.inner.rack_records).get(&rack_id).cloned();
        let rack = match known {
            Some(rack) => Some(rack),
            None => {
                let racks = self.inner.racks.list_racks().await?;
                let found = racks.iter().find(|r| r.id == rack_id).cloned();
                *lock(&self.inner.rack_records) = racks.into_iter().map(|r| (r.id, r)).collect();
                found
            }
        };
        Ok(rack.and_then(|r| r.ottoeject_id))
    }

    async fn reserve_shelf(&self, job: &PrintJob, rack_id: RackId) -> Result<Shelf, CacheError> {
        let cache = &self.inner.rack_cache;
        match job.shelf_id {
            Some(shelf_id) => cache.reserve(rack_id, shelf_id, job.id).await,
            None => {
                let criteria = ShelfCriteria { min_clearance_mm: job.print_height_mm, shelf_id: None };
                cache.reserve_available(rack_id, &criteria, job.id).await
            }
        }
    }

    /// Test-and-set on the workflow map.
    fn claim(&self, job: &PrintJob, ottoeject_id: Option<OttoejectId>) -> Option<(PrinterClaim, watch::Receiver<bool>)> {
        let mut workflows = lock(&self.inner.workflows);
        if workflows.contains_key(&job.printer_id) {
            return None;
        }
        let run_id = Uuid::new_v4();
        let now = Utc::now();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        workflows.insert(
            job.printer_id,
            WorkflowSlot {
                run_id,
                snapshot: WorkflowSnapshot {
                    run_id,
                    job_id: job.id,
                    printer_id: job.printer_id,
                    ottoeject_id,
                    rack_id: job.rack_id,
                    shelf_id: None,
                    state: JobStatus::Dispatching,
                    retry_count: 0,
                    started_at: now,
                    last_update: now,
                    progress_percent: None,
                    error: None,
                },
                cancel_tx,
                handle: None,
                updated: Instant::now(),
            },
        );
        let claim = PrinterClaim {
            inner: self.inner.clone(),
            printer_id: job.printer_id,
            run_id,
            keep_history: true,
        };
        Some((claim, cancel_rx))
    }

    /// Runs one tick in the background. Refused while processing is disabled.
    pub fn trigger_job_processing(&self) -> bool {
        if !self.inner.processing_enabled() {
            return false;
        }
        let orchestrator = self.clone();
        tokio::spawn(async move {
            orchestrator.tick().await;
        });
        true
    }

    pub fn enable_job_processing(&self) {
        if !self.inner.enabled.swap(true, Ordering::SeqCst) {
            tracing::info!("job processing enabled");
        }
    }

    /// New dispatches stop; running workflows carry on to their end.
    pub fn disable_job_processing(&self) {
        if self.inner.enabled.swap(false, Ordering::SeqCst) {
            tracing::info!(active = self.active_count(), "job processing disabled");
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    pub fn get_job_processing_status(&self) -> ProcessingStatus {
        ProcessingStatus {
            enabled: self.inner.processing_enabled(),
            initialized: self.is_initialized(),
            active_workflows: self.active_count(),
            tick_interval_ms: self.inner.config.tick_interval_ms,
            last_tick_at: lock(&self.inner.stats).last_tick_at(),
            awaiting_bed_clear: lock(&self.inner.awaiting_bed_clear).iter().copied().collect(),
        }
    }

    pub fn get_stats(&self) -> OrchestratorStats {
        let active = self.active_count();
        lock(&self.inner.stats).snapshot(active)
    }

    /// Unhealthy when the repository is unreachable or most printers are;
    /// degraded when any printer is unreachable or dispatch is off.
    pub async fn health_check(&self) -> HealthReport {
        let repository_reachable = self.inner.printers.list_printers().await.is_ok();
        let links = self.inner.connections.link_summary();
        let count = |state: LinkState| links.iter().filter(|(_, link)| *link == state).count();
        let online = count(LinkState::Online);
        let reconnecting = count(LinkState::Reconnecting);
        let offline = count(LinkState::Offline);
        let unreachable = reconnecting + offline;
        let enabled = self.inner.processing_enabled();

        let status = if !repository_reachable || unreachable * 2 > links.len() {
            HealthState::Unhealthy
        } else if unreachable > 0 || !enabled {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        };
        HealthReport {
            status,
            repository_reachable,
            job_processing_enabled: enabled,
            printers_total: links.len(),
            printers_online: online,
            printers_reconnecting: reconnecting,
            printers_offline: offline,
            active_workflows: self.active_count(),
            stale_workflows: self.stale_count(),
            checked_at: Utc::now(),
        }
    }

    pub async fn invalidate_all_caches(&self) {
        self.inner.rack_cache.invalidate_all().await;
        lock(&self.inner.rack_records).clear();
    }

    pub async fn cancel_job(&self, job_id: JobId) -> Result<CancelDisposition, OrchestratorError> {
        {
            let workflows = lock(&self.inner.workflows);
            if let Some(slot) = workflows.values().find(|slot| slot.snapshot.job_id == job_id) {
                slot.cancel_tx.send_replace(true);
                if slot.snapshot.state == JobStatus::Ejecting {
                    tracing::info!(job_id, "cancel deferred until the eject sequence ends");
                    return Ok(CancelDisposition::Deferred);
                }
                tracing::info!(job_id, state = %slot.snapshot.state, "cancel requested");
                return Ok(CancelDisposition::Requested);
            }
        }
        let job = self.inner.jobs.get(job_id).await?.ok_or(OrchestratorError::JobNotFound(job_id))?;
        if job.status.is_terminal() {
            return Err(OrchestratorError::AlreadyFinished { job_id, status: job.status });
        }
        self.inner.jobs.cancel(job_id).await?;
        lock(&self.inner.stats).record_finished(JobStatus::Cancelled, std::time::Duration::ZERO);
        tracing::info!(job_id, "queued job cancelled");
        Ok(CancelDisposition::Cancelled)
    }

    pub fn active_workflows(&self) -> Vec<WorkflowSnapshot> {
        let mut active: Vec<_> = lock(&self.inner.workflows).values().map(|slot| slot.snapshot.clone()).collect();
        active.sort_by_key(|snapshot| snapshot.printer_id);
        active
    }

    /// Finished workflows, newest first.
    pub fn history(&self) -> Vec<WorkflowSnapshot> {
        lock(&self.inner.history).iter().cloned().collect()
    }

    /// Operator confirmation that a part left without a rack was removed.
    /// Returns false if the printer was not waiting.
    pub fn mark_bed_cleared(&self, printer_id: PrinterId) -> bool {
        let removed = lock(&self.inner.awaiting_bed_clear).remove(&printer_id);
        if removed {
            tracing::info!(printer_id, "bed cleared");
            tokio::spawn(self.dispatch_next(printer_id));
        }
        removed
    }

    pub fn awaiting_bed_clear(&self) -> Vec<PrinterId> {
        lock(&self.inner.awaiting_bed_clear).iter().copied().collect()
    }
}
