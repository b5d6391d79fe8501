//! Shared setup for orchestrator integration tests: simulated printers and
//! ottoeject over an in-memory store, with timings shrunk to milliseconds.
#![allow(dead_code)]

use ottoflow::adapters::AdapterRegistry;
use ottoflow::connection::ConnectionManager;
use ottoflow::orchestrator::{Orchestrator, OrchestratorParts};
use ottoflow::rack_cache::RackCache;
use ottoflow::repository::InMemoryStore;
use ottoflow::shared::backoff::BackoffPolicy;
use ottoflow::shared::config::{ConnectionConfig, OrchestratorConfig};
use ottoflow::shared::model::{
    JobStatus, OttoejectId, PrinterId, PrinterRecord, RackId, RackRecord, Shelf,
};
use ottoflow::shared::PrintState;
use ottoflow_simulator::{SimulatedOttoeject, SimulatedPrinter};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        tick_interval_ms: 50,
        retry_budget: 3,
        retry_backoff: BackoffPolicy::fixed(Duration::from_millis(10)),
        command_timeout_ms: 1_000,
        macro_timeout_ms: 1_000,
        ejector_idle_poll_ms: 5,
        ejector_idle_timeout_ms: 1_000,
        ejector_lock_timeout_ms: 5_000,
        bed_settle_ms: 1,
        max_stream_reconnects: 3,
        completion_grace_ms: 5_000,
        max_print_duration_ms: 60_000,
        stale_workflow_after_ms: 60_000,
        history_len: 20,
        start_enabled: true,
        shutdown_grace_ms: 500,
    }
}

pub fn fast_connection() -> ConnectionConfig {
    ConnectionConfig {
        auth_timeout_ms: 500,
        reconnect_attempts: 3,
        backoff: BackoffPolicy::fixed(Duration::from_millis(10)),
        subscriber_buffer: 32,
        status_max_age_ms: 10_000,
        status_poll_ms: 20,
        upload_timeout_ms: 1_000,
    }
}

pub fn printer_record(id: PrinterId) -> PrinterRecord {
    PrinterRecord {
        id,
        name: format!("printer-{}", id),
        brand: "simulated".to_string(),
        model: String::new(),
        address: "sim".to_string(),
        credentials: Default::default(),
    }
}

pub fn shelves(rack_id: RackId, count: u32) -> Vec<Shelf> {
    (1..=count).map(|n| Shelf::new(rack_id, u64::from(n), n)).collect()
}

/// Fast script for quick prints.
pub fn quick_script() -> (Vec<PrintState>, Duration) {
    (
        vec![PrintState::Preparing, PrintState::Running, PrintState::Running, PrintState::Completed],
        Duration::from_millis(20),
    )
}

/// Long enough to act on the job while it prints.
pub fn medium_script() -> (Vec<PrintState>, Duration) {
    let mut script = vec![PrintState::Running; 8];
    script.push(PrintState::Completed);
    (script, Duration::from_millis(25))
}

/// A print that keeps running long enough to interact with it.
pub fn long_script() -> (Vec<PrintState>, Duration) {
    let mut script = vec![PrintState::Running; 40];
    script.push(PrintState::Completed);
    (script, Duration::from_millis(50))
}

pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub printers: HashMap<PrinterId, SimulatedPrinter>,
    pub ejector: SimulatedOttoeject,
    pub connections: Arc<ConnectionManager>,
    pub rack_cache: Arc<RackCache>,
    pub orchestrator: Orchestrator,
}

pub struct HarnessBuilder {
    config: OrchestratorConfig,
    store: InMemoryStore,
    printers: HashMap<PrinterId, SimulatedPrinter>,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self { config: fast_config(), store: InMemoryStore::new(), printers: HashMap::new() }
    }

    pub fn config(mut self, edit: impl FnOnce(&mut OrchestratorConfig)) -> Self {
        edit(&mut self.config);
        self
    }

    pub fn printer(self, id: PrinterId, script: (Vec<PrintState>, Duration)) -> Self {
        self.printer_record(printer_record(id), script)
    }

    pub fn printer_record(mut self, record: PrinterRecord, script: (Vec<PrintState>, Duration)) -> Self {
        let sim = SimulatedPrinter::new(record.name.clone()).with_print_script(script.0, script.1);
        self.printers.insert(record.id, sim);
        self.store.add_printer(record);
        self
    }

    pub fn rack(self, id: RackId, ottoeject_id: Option<OttoejectId>, shelf_count: u32) -> Self {
        self.store.add_rack(
            RackRecord { id, name: format!("rack-{}", id), ottoeject_id },
            shelves(id, shelf_count),
        );
        self
    }

    pub fn store(self, edit: impl FnOnce(&InMemoryStore)) -> Self {
        edit(&self.store);
        self
    }

    /// Builds everything without initializing.
    pub fn build(self) -> Harness {
        let store = Arc::new(self.store);
        let mut registry = AdapterRegistry::new();
        for (id, sim) in &self.printers {
            registry.register_instance(*id, Arc::new(sim.clone()));
        }
        let connections = Arc::new(ConnectionManager::new(
            registry,
            fast_connection(),
            self.config.command_timeout(),
        ));
        let rack_cache = Arc::new(RackCache::new(store.clone(), Duration::from_secs(30)));
        let ejector = SimulatedOttoeject::new();
        let orchestrator = Orchestrator::new(OrchestratorParts {
            config: self.config,
            connections: connections.clone(),
            rack_cache: rack_cache.clone(),
            jobs: store.clone(),
            printers: store.clone(),
            racks: store.clone(),
            ottoeject: Arc::new(ejector.clone()),
        });
        Harness { store, printers: self.printers, ejector, connections, rack_cache, orchestrator }
    }

    /// Builds and initializes. The control loop is not started; tests tick by hand.
    pub async fn start(self) -> Harness {
        let harness = self.build();
        harness.orchestrator.initialize().await.unwrap();
        harness
    }
}

impl Harness {
    pub fn printer(&self, id: PrinterId) -> &SimulatedPrinter {
        &self.printers[&id]
    }

    pub fn job_status(&self, job_id: u64) -> JobStatus {
        self.store.job(job_id).unwrap().status
    }

    /// Waits until the job has been moved to `status` at some point.
    pub async fn wait_for_status(&self, job_id: u64, status: JobStatus) {
        wait_for(&format!("job {} to reach {}", job_id, status), || {
            self.store.status_history(job_id).contains(&status)
        })
        .await;
    }

    /// Waits until no workflow is running.
    pub async fn wait_idle(&self) {
        wait_for("workflows to finish", || self.orchestrator.active_workflows().is_empty()).await;
    }
}

pub async fn wait_for(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
