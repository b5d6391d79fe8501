use chrono::{DateTime, Utc};
use ottoflow_shared::api_models::OrchestratorStats;
use ottoflow_shared::model::{JobStatus, PrinterId};
use std::collections::HashSet;
use std::time::Duration;

/// Running counters behind `/statistics`.
#[derive(Debug, Default)]
pub(crate) struct StatsCollector {
    ticks: u64,
    coalesced_triggers: u64,
    jobs_dispatched: u64,
    jobs_deferred: u64,
    jobs_completed: u64,
    jobs_failed: u64,
    jobs_cancelled: u64,
    retries: u64,
    printers_used: HashSet<PrinterId>,
    last_tick: Option<Duration>,
    total_tick: Duration,
    total_processing: Duration,
    last_tick_at: Option<DateTime<Utc>>,
}

impl StatsCollector {
    pub fn record_tick(&mut self, took: Duration) {
        self.ticks += 1;
        self.last_tick = Some(took);
        self.total_tick += took;
        self.last_tick_at = Some(Utc::now());
    }

    pub fn record_coalesced(&mut self) {
        self.coalesced_triggers += 1;
    }

    pub fn record_dispatch(&mut self, printer_id: PrinterId) {
        self.jobs_dispatched += 1;
        self.printers_used.insert(printer_id);
    }

    pub fn record_deferred(&mut self) {
        self.jobs_deferred += 1;
    }

    pub fn record_retry(&mut self) {
        self.retries += 1;
    }

    pub fn record_finished(&mut self, status: JobStatus, took: Duration) {
        match status {
            JobStatus::Completed => {
                self.jobs_completed += 1;
                self.total_processing += took;
            }
            JobStatus::Failed => self.jobs_failed += 1,
            JobStatus::Cancelled => self.jobs_cancelled += 1,
            _ => {}
        }
    }

    pub fn last_tick_at(&self) -> Option<DateTime<Utc>> {
        self.last_tick_at
    }

    pub fn snapshot(&self, active_workflows: usize) -> OrchestratorStats {
        let average_tick_ms = (self.ticks > 0).then(|| self.total_tick.as_millis() as u64 / self.ticks);
        let average_processing_ms = (self.jobs_completed > 0)
            .then(|| (self.total_processing.as_millis() / u128::from(self.jobs_completed)) as u64);
        OrchestratorStats {
            ticks: self.ticks,
            coalesced_triggers: self.coalesced_triggers,
            jobs_dispatched: self.jobs_dispatched,
            jobs_deferred: self.jobs_deferred,
            jobs_completed: self.jobs_completed,
            jobs_failed: self.jobs_failed,
            jobs_cancelled: self.jobs_cancelled,
            retries: self.retries,
            printers_utilized: self.printers_used.len(),
            active_workflows,
            last_tick_ms: self.last_tick.map(|d| d.as_millis() as u64),
            average_tick_ms,
            average_processing_ms,
        }
    }
}
