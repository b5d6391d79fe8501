//! Boots a whole farm from a config file, the way `ottoflow --simulate` does,
//! and lets the control loop drain the queue.

mod common;

use common::wait_for;
use ottoflow::adapters::AdapterRegistry;
use ottoflow::config::load_config;
use ottoflow::connection::ConnectionManager;
use ottoflow::orchestrator::macros::{HOME, PARK};
use ottoflow::orchestrator::{Orchestrator, OrchestratorParts};
use ottoflow::rack_cache::RackCache;
use ottoflow::repository::InMemoryStore;
use ottoflow::shared::model::JobStatus;
use ottoflow_simulator::SimulatedOttoeject;
use std::fs::File;
use std::io::Write;
use std::sync::Arc;
use tempfile::tempdir;

const FARM: &str = r#"
[orchestrator]
tick_interval_ms = 20
bed_settle_ms = 1
ejector_idle_poll_ms = 5
shutdown_grace_ms = 500

[connection]
status_poll_ms = 20

[[printers]]
id = 1
name = "a1-left"
brand = "bambu"
model = "A1"
address = "sim"

[[printers]]
id = 2
name = "kobra-right"
brand = "anycubic"
model = "kobra s1"
address = "sim"

[[ottoejects]]
id = 1
name = "eject-1"
address = "sim"

[[racks]]
id = 1
name = "rack-a"
ottoeject_id = 1
shelves = 4
shelf_clearance_mm = 120.0

[[jobs]]
id = 10
printer_id = 1
file = { name = "bracket.gcode" }
rack_id = 1

[[jobs]]
id = 11
printer_id = 1
file = { name = "hinge.gcode" }
rack_id = 1
priority = 5

[[jobs]]
id = 20
printer_id = 2
file = { name = "knob.gcode" }
rack_id = 1
print_height_mm = 40.0
"#;

#[tokio::test]
async fn simulated_farm_drains_its_queue() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ottoflow.toml");
    let mut file = File::create(&path).unwrap();
    write!(file, "{}", FARM).unwrap();

    let config = load_config(&path).unwrap();
    let store = Arc::new(InMemoryStore::from_config(&config));
    let ejector = SimulatedOttoeject::new();
    let connections = Arc::new(ConnectionManager::new(
        AdapterRegistry::simulated(),
        config.connection.clone(),
        config.orchestrator.command_timeout(),
    ));
    let orchestrator = Orchestrator::new(OrchestratorParts {
        config: config.orchestrator.clone(),
        connections: connections.clone(),
        rack_cache: Arc::new(RackCache::new(store.clone(), config.cache.ttl())),
        jobs: store.clone(),
        printers: store.clone(),
        racks: store.clone(),
        ottoeject: Arc::new(ejector.clone()),
    });

    let report = orchestrator.initialize().await.unwrap();
    assert_eq!(report.online, vec![1, 2]);
    orchestrator.start().unwrap();

    let finished = |id| store.job(id).is_some_and(|job| job.status == JobStatus::Completed);
    wait_for("every job to complete", || finished(10) && finished(11) && finished(20)).await;

    // the higher-priority job on printer 1 went first
    let job_10 = store.job(10).unwrap();
    let job_11 = store.job(11).unwrap();
    assert!(job_11.started_at.unwrap() <= job_10.started_at.unwrap());

    let occupied: Vec<_> = (1..=4)
        .filter_map(|shelf| store.shelf(1, shelf))
        .filter(|shelf| shelf.occupied)
        .filter_map(|shelf| shelf.contents)
        .collect();
    assert_eq!(occupied.len(), 3);
    for job_id in [10, 11, 20] {
        assert!(occupied.contains(&job_id));
    }

    let executed = ejector.executed();
    assert_eq!(executed.iter().filter(|m| m.as_str() == HOME).count(), 3);
    assert_eq!(executed.iter().filter(|m| m.as_str() == PARK).count(), 3);
    assert_eq!(ejector.max_concurrent(1), 1);

    wait_for("workflows to wind down", || orchestrator.active_workflows().is_empty()).await;
    orchestrator.shutdown().await;
    assert!(connections.is_closed());
    assert_eq!(orchestrator.get_stats().jobs_completed, 3);
}
