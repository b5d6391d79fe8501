//! One job's trip through the state machine:
//! DISPATCHING -> PRINTING -> AWAITING_EJECT -> EJECTING -> COMPLETED,
//! with FAILED or CANCELLED possible from any non-terminal state.

use super::macros::{EjectPlan, PrinterProfile};
use super::{Orchestrator, PrinterClaim};
use futures_util::StreamExt;
use ottoflow_shared::model::{JobStatus, OttoejectId, PrintJob, PrinterRecord, Shelf};
use ottoflow_shared::ottoeject::{EjectorState, MacroError};
use ottoflow_shared::{AdapterError, DeviceStatus, PrintState, StartOptions, StatusStream};
use std::fmt::Display;
use std::time::Instant;
use tokio::sync::watch;

/// Why a workflow stopped short of COMPLETED.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Outcome {
    Failed(String),
    Cancelled,
}

impl Outcome {
    fn failed(message: impl Into<String>) -> Self {
        Outcome::Failed(message.into())
    }
}

pub(crate) struct WorkflowRun {
    orchestrator: Orchestrator,
    claim: PrinterClaim,
    cancel_rx: watch::Receiver<bool>,
    job: PrintJob,
    printer: PrinterRecord,
    ottoeject_id: Option<OttoejectId>,
    shelf: Option<Shelf>,
    state: JobStatus,
    retry_count: u32,
    started: Instant,
    /// The print finished and the part is still on the bed.
    part_on_bed: bool,
    /// The part made it onto the shelf.
    stored: bool,
}

impl WorkflowRun {
    pub fn new(
        orchestrator: Orchestrator,
        claim: PrinterClaim,
        cancel_rx: watch::Receiver<bool>,
        job: PrintJob,
        printer: PrinterRecord,
        ottoeject_id: Option<OttoejectId>,
        shelf: Option<Shelf>,
    ) -> Self {
        Self {
            orchestrator,
            claim,
            cancel_rx,
            job,
            printer,
            ottoeject_id,
            shelf,
            state: JobStatus::Dispatching,
            retry_count: 0,
            started: Instant::now(),
            part_on_bed: false,
            stored: false,
        }
    }

    pub async fn execute(mut self) {
        let outcome = self.drive().await;
        self.finish(outcome).await;
        let printer_id = self.claim.printer_id();
        let orchestrator = self.orchestrator.clone();
        drop(self);
        if orchestrator.inner.processing_enabled() {
            orchestrator.dispatch_next(printer_id).await;
        }
    }

    async fn drive(&mut self) -> Result<(), Outcome> {
        let stream = self.dispatch().await?;
        self.transition(JobStatus::Printing, None).await?;
        self.await_completion(stream).await?;
        self.part_on_bed = true;

        if self.shelf.is_none() {
            tracing::info!(job_id = self.job.id, "no rack for this job, part stays on the bed");
            return Ok(());
        }
        self.transition(JobStatus::AwaitingEject, None).await?;
        self.check_cancelled()?;
        self.eject().await
    }

    fn cancel_requested(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    fn check_cancelled(&self) -> Result<(), Outcome> {
        if self.cancel_requested() { Err(Outcome::Cancelled) } else { Ok(()) }
    }

    async fn transition(&mut self, next: JobStatus, message: Option<String>) -> Result<(), Outcome> {
        let inner = &self.orchestrator.inner;
        if let Err(e) = inner.jobs.update_status(self.job.id, next, message).await {
            if let Ok(Some(job)) = inner.jobs.get(self.job.id).await {
                if job.status == JobStatus::Cancelled {
                    tracing::info!(job_id = self.job.id, "job was cancelled in the repository");
                    return Err(Outcome::Cancelled);
                }
            }
            tracing::warn!(job_id = self.job.id, "recording {} failed: {}", next, e);
        }
        tracing::info!(job_id = self.job.id, printer_id = self.printer.id, "job {} -> {}", self.state, next);
        self.state = next;
        self.claim.update(|snapshot| snapshot.state = next);
        Ok(())
    }

    /// Spends one unit of the retry budget and waits out the backoff.
    /// Cancellation cuts the wait short unless `honor_cancel` is false.
    async fn back_off(&mut self, what: &str, error: &(dyn Display + Send + Sync), honor_cancel: bool) -> Result<(), Outcome> {
        let inner = &self.orchestrator.inner;
        if self.retry_count >= inner.config.retry_budget {
            return Err(Outcome::failed(format!("{} failed after {} retries: {}", what, self.retry_count, error)));
        }
        let delay = inner.config.retry_backoff.delay_for(self.retry_count);
        self.retry_count += 1;
        let retry_count = self.retry_count;
        lock_stats(&self.orchestrator).record_retry();
        self.claim.update(|snapshot| {
            snapshot.retry_count = retry_count;
            snapshot.error = Some(error.to_string());
        });
        tracing::warn!(
            job_id = self.job.id,
            attempt = retry_count,
            "{} failed, retrying in {:?}: {}",
            what,
            delay,
            error
        );
        if honor_cancel {
            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    changed = self.cancel_rx.changed() => {
                        if changed.is_err() || self.cancel_requested() {
                            return Err(Outcome::Cancelled);
                        }
                    }
                }
            }
            self.check_cancelled()
        } else {
            tokio::time::sleep(delay).await;
            Ok(())
        }
    }

    /// Upload (when needed) and start. The status feed is opened first so no
    /// update from the new print is missed. A cancel is honored between the
    /// steps; one that lands while the start is in flight stops the print.
    async fn dispatch(&mut self) -> Result<StatusStream, Outcome> {
        let connections = self.orchestrator.inner.connections.clone();
        let printer_id = self.printer.id;
        let file = self.job.file.clone();
        let options = StartOptions { plate_index: None, job_id: Some(self.job.id) };
        loop {
            self.check_cancelled()?;
            let prepared = async {
                let stream = connections.subscribe(printer_id)?;
                let can_upload = connections.capabilities(printer_id).is_some_and(|c| c.upload);
                if file.local_path.is_some() && can_upload {
                    connections.upload(printer_id, &file).await?;
                }
                Ok::<_, AdapterError>(stream)
            }
            .await;
            let stream = match prepared {
                Ok(stream) => stream,
                Err(e) if e.is_retryable() => {
                    self.back_off("upload", &e, true).await?;
                    continue;
                }
                Err(e) => return Err(Outcome::failed(format!("dispatch failed: {}", e))),
            };

            self.check_cancelled()?;
            match connections.start(printer_id, &file, &options).await {
                Ok(_) if self.cancel_requested() => {
                    self.stop_print().await;
                    return Err(Outcome::Cancelled);
                }
                Ok(_) => return Ok(stream),
                Err(e) if e.is_retryable() => self.back_off("dispatch", &e, true).await?,
                Err(e) => return Err(Outcome::failed(format!("dispatch failed: {}", e))),
            }
        }
    }

    /// Best-effort cancel on the printer itself.
    async fn stop_print(&self) {
        let printer_id = self.printer.id;
        if let Err(e) = self.orchestrator.inner.connections.cancel(printer_id).await {
            tracing::warn!(job_id = self.job.id, printer_id, "cancelling print on printer failed: {}", e);
        }
    }

    /// Follows the printer's status feed until the print completes.
    ///
    /// A COMPLETED or IDLE seen before the print was observed running belongs
    /// to the previous job and is ignored until `completion_grace` passes.
    async fn await_completion(&mut self, mut stream: StatusStream) -> Result<(), Outcome> {
        let config = self.orchestrator.inner.config.clone();
        let printer_id = self.printer.id;
        let deadline = tokio::time::Instant::now() + config.max_print_duration();
        let grace = tokio::time::sleep(config.completion_grace());
        tokio::pin!(grace);
        let mut seen_active = false;
        let mut armed = false;
        let mut last: Option<DeviceStatus> = None;
        // Consecutive feed losses; a resubscribed feed that delivers news clears it.
        let mut reconnects = 0;

        loop {
            let next = tokio::select! {
                changed = self.cancel_rx.changed() => {
                    if changed.is_ok() && !self.cancel_requested() {
                        continue;
                    }
                    self.stop_print().await;
                    return Err(Outcome::Cancelled);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(Outcome::failed(format!(
                        "print exceeded {:?}",
                        config.max_print_duration()
                    )));
                }
                _ = &mut grace, if !armed => {
                    armed = true;
                    match last.as_ref().map(|s| s.effective_state()) {
                        Some(PrintState::Completed) => return Ok(()),
                        _ => continue,
                    }
                }
                next = stream.next() => next,
            };

            let Some(status) = next else {
                reconnects += 1;
                if reconnects > config.max_stream_reconnects {
                    return Err(Outcome::failed("lost the printer's status feed"));
                }
                tracing::warn!(job_id = self.job.id, printer_id, attempt = reconnects, "status feed ended, resubscribing");
                stream = self.resubscribe(reconnects).await?;
                continue;
            };
            // a new subscription replays the last observation first
            if reconnects > 0 && last.as_ref().is_none_or(|seen| status.observed_at > seen.observed_at) {
                tracing::debug!(job_id = self.job.id, printer_id, "status feed recovered");
                reconnects = 0;
            }

            let state = status.effective_state();
            let progress = status.progress_percent;
            self.claim.update(|snapshot| {
                if progress.is_some() {
                    snapshot.progress_percent = progress;
                }
            });
            match state {
                PrintState::Preparing | PrintState::Running | PrintState::Paused => {
                    if !seen_active {
                        tracing::debug!(job_id = self.job.id, printer_id, "print observed running");
                    }
                    seen_active = true;
                    armed = true;
                }
                PrintState::Error => {
                    let code = status.error_code.clone().unwrap_or_else(|| "unknown".to_string());
                    return Err(Outcome::failed(format!("printer reported error {}", code)));
                }
                PrintState::Completed if armed => return Ok(()),
                PrintState::Completed => {
                    tracing::debug!(job_id = self.job.id, printer_id, "ignoring completion from before this print");
                }
                PrintState::Idle if seen_active => {
                    return Err(Outcome::failed("print stopped on the printer"));
                }
                _ => {}
            }
            last = Some(status);
        }
    }

    async fn resubscribe(&mut self, attempt: u32) -> Result<StatusStream, Outcome> {
        let inner = &self.orchestrator.inner;
        let delay = inner.config.retry_backoff.delay_for(attempt.saturating_sub(1));
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                changed = self.cancel_rx.changed() => {
                    if changed.is_err() || self.cancel_requested() {
                        return Err(Outcome::Cancelled);
                    }
                }
            }
        }
        inner
            .connections
            .subscribe(self.printer.id)
            .map_err(|e| Outcome::failed(format!("status feed unavailable: {}", e)))
    }

    /// Moves the part from the bed to the reserved shelf. Once EJECTING, a
    /// cancel waits for the sequence to end.
    async fn eject(&mut self) -> Result<(), Outcome> {
        let (Some(ottoeject_id), Some(shelf)) = (self.ottoeject_id, self.shelf.clone()) else {
            return Err(Outcome::failed("no ottoeject or shelf assigned"));
        };
        let inner = self.orchestrator.inner.clone();
        let device = inner.ejector_lock(ottoeject_id);
        let _device = match tokio::time::timeout(inner.config.ejector_lock_timeout(), device.lock_owned()).await {
            Ok(guard) => guard,
            Err(_) => return Err(Outcome::failed(format!("ottoeject {} stayed busy", ottoeject_id))),
        };
        self.check_cancelled()?;
        self.transition(JobStatus::Ejecting, None).await?;

        let profile = PrinterProfile::detect(&self.printer.brand, &self.printer.model);
        let last_job = match inner.jobs.list_runnable(self.printer.id).await {
            Ok(queued) => queued.is_empty(),
            Err(_) => false,
        };
        let plan = EjectPlan::new(profile, shelf.number, last_job);

        if let Some(gcode) = plan.bed_positioning {
            let can_send = inner.connections.capabilities(self.printer.id).is_some_and(|c| c.send_raw);
            if can_send {
                match inner.connections.send_raw(self.printer.id, gcode).await {
                    Ok(()) => tokio::time::sleep(inner.config.bed_settle()).await,
                    Err(e) => tracing::warn!(job_id = self.job.id, "bed positioning failed, ejecting anyway: {}", e),
                }
            }
        }

        loop {
            match self.run_macros(ottoeject_id, &plan.macros).await {
                Ok(()) => break,
                Err(e) if e.is_retryable() => self.back_off("eject", &e, false).await?,
                Err(e) => return Err(Outcome::failed(format!("eject failed: {}", e))),
            }
        }
        self.part_on_bed = false;
        self.stored = true;

        if let Err(e) = inner.rack_cache.confirm_occupied(shelf.rack_id, shelf.id, self.job.id).await {
            tracing::error!(
                job_id = self.job.id,
                rack_id = shelf.rack_id,
                shelf_id = shelf.id,
                kind = ?e.kind(),
                "part stored but shelf not marked occupied: {}",
                e
            );
        }
        if self.cancel_requested() {
            tracing::info!(job_id = self.job.id, "cancel arrived during eject, part already stored");
        }
        Ok(())
    }

    async fn run_macros(&self, ottoeject_id: OttoejectId, macros: &[String]) -> Result<(), MacroError> {
        let inner = &self.orchestrator.inner;
        let timeout = inner.config.macro_timeout();
        for name in macros {
            tracing::debug!(job_id = self.job.id, ottoeject_id, macro_name = %name, "running macro");
            match tokio::time::timeout(timeout, inner.ottoeject.execute_macro(ottoeject_id, name)).await {
                Ok(result) => result?,
                Err(_) => return Err(MacroError::Timeout(timeout)),
            }
            self.wait_until_idle(ottoeject_id, name).await?;
        }
        Ok(())
    }

    async fn wait_until_idle(&self, ottoeject_id: OttoejectId, macro_name: &str) -> Result<(), MacroError> {
        let inner = &self.orchestrator.inner;
        let limit = inner.config.ejector_idle_timeout();
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            match inner.ottoeject.get_status(ottoeject_id).await? {
                EjectorState::Idle => return Ok(()),
                EjectorState::Busy => {}
                EjectorState::Error => {
                    return Err(MacroError::Failed {
                        name: macro_name.to_string(),
                        reason: "ottoeject reported an error".to_string(),
                    });
                }
                EjectorState::Offline => {
                    return Err(MacroError::Network(format!("ottoeject {} went offline", ottoeject_id)));
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(MacroError::Timeout(limit));
            }
            tokio::time::sleep(inner.config.ejector_idle_poll()).await;
        }
    }

    /// Records the terminal status, releases an unused shelf and flags a bed
    /// that still holds a part.
    async fn finish(&mut self, outcome: Result<(), Outcome>) {
        let inner = self.orchestrator.inner.clone();
        let job_id = self.job.id;
        let (status, message) = match &outcome {
            Ok(()) => (JobStatus::Completed, None),
            Err(Outcome::Failed(message)) => (JobStatus::Failed, Some(message.clone())),
            Err(Outcome::Cancelled) => (JobStatus::Cancelled, Some("cancelled".to_string())),
        };

        let recorded = if status == JobStatus::Cancelled {
            inner.jobs.cancel(job_id).await
        } else {
            inner.jobs.update_status(job_id, status, message.clone()).await
        };
        if let Err(e) = recorded {
            tracing::error!(job_id, "recording final status {} failed: {}", status, e);
        }

        if !self.stored {
            if let Some(shelf) = &self.shelf {
                if let Err(e) = inner.rack_cache.release(shelf.rack_id, shelf.id, job_id).await {
                    tracing::warn!(job_id, shelf_id = shelf.id, "releasing shelf reservation failed: {}", e);
                }
            }
        }
        if self.part_on_bed {
            ottoflow_shared::lock(&inner.awaiting_bed_clear).insert(self.printer.id);
            tracing::warn!(printer_id = self.printer.id, job_id, "part left on the bed, waiting for it to be cleared");
        }

        let retry_count = self.retry_count;
        self.claim.update(|snapshot| {
            snapshot.state = status;
            snapshot.retry_count = retry_count;
            if let Some(message) = &message {
                snapshot.error = Some(message.clone());
            }
        });
        lock_stats(&self.orchestrator).record_finished(status, self.started.elapsed());
        match status {
            JobStatus::Completed => tracing::info!(job_id, printer_id = self.printer.id, retries = retry_count, "job completed"),
            JobStatus::Cancelled => tracing::info!(job_id, printer_id = self.printer.id, "job cancelled"),
            _ => tracing::error!(
                job_id,
                printer_id = self.printer.id,
                "job failed: {}",
                message.as_deref().unwrap_or("unknown")
            ),
        }
    }
}

fn lock_stats(orchestrator: &Orchestrator) -> std::sync::MutexGuard<'_, super::StatsCollector> {
    ottoflow_shared::lock(&orchestrator.inner.stats)
}
