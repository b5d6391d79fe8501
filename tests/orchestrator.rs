//! End-to-end workflow scenarios against simulated devices.

mod common;

use common::{long_script, medium_script, quick_script, wait_for, HarnessBuilder};
use ottoflow::adapters::moonraker::parse_status;
use ottoflow::orchestrator::{CancelDisposition, OrchestratorError};
use ottoflow::shared::api_models::HealthState;
use ottoflow::shared::model::{JobStatus, PrintJob};
use ottoflow::shared::{DeviceStatus, FileRef, PrintState};
use serde_json::json;
use std::time::Duration;

fn job(id: u64, printer_id: u64) -> PrintJob {
    PrintJob::new(id, printer_id, FileRef::remote(format!("part-{}.gcode", id)))
}

#[tokio::test]
async fn higher_priority_job_runs_first() {
    let h = HarnessBuilder::new()
        .printer(1, quick_script())
        .rack(1, Some(1), 4)
        .store(|s| {
            s.add_job(job(10, 1).with_rack(1).with_priority(1));
            s.add_job(job(11, 1).with_rack(1).with_priority(5));
        })
        .start()
        .await;

    assert!(h.orchestrator.tick().await);
    h.wait_for_status(10, JobStatus::Completed).await;
    h.wait_for_status(11, JobStatus::Completed).await;

    assert_eq!(h.printer(1).log().starts, vec!["part-11.gcode", "part-10.gcode"]);
    let first = h.store.shelf(1, 1).unwrap();
    let second = h.store.shelf(1, 2).unwrap();
    assert_eq!((first.occupied, first.contents), (true, Some(11)));
    assert_eq!((second.occupied, second.contents), (true, Some(10)));
}

#[tokio::test]
async fn repeated_running_updates_give_one_transition() {
    let h = HarnessBuilder::new()
        .printer(
            1,
            (vec![PrintState::Running, PrintState::Running, PrintState::Completed], Duration::from_millis(20)),
        )
        .rack(1, Some(1), 2)
        .store(|s| s.add_job(job(1, 1).with_rack(1)))
        .start()
        .await;

    h.orchestrator.tick().await;
    h.wait_for_status(1, JobStatus::Completed).await;

    assert_eq!(
        h.store.status_history(1),
        vec![
            JobStatus::Dispatching,
            JobStatus::Printing,
            JobStatus::AwaitingEject,
            JobStatus::Ejecting,
            JobStatus::Completed,
        ]
    );
    assert_eq!(
        h.ejector.executed(),
        vec!["OTTOEJECT_HOME", "EJECT_FROM_GENERIC_PRINTER", "STORE_TO_SLOT_1", "PARK_OTTOEJECT"]
    );
}

#[tokio::test]
async fn eject_failing_twice_still_completes_within_budget() {
    let h = HarnessBuilder::new()
        .printer(1, quick_script())
        .rack(1, Some(1), 2)
        .store(|s| s.add_job(job(1, 1).with_rack(1)))
        .start()
        .await;
    h.ejector.fail_next(2);

    h.orchestrator.tick().await;
    h.wait_for_status(1, JobStatus::Completed).await;
    h.wait_idle().await;

    let finished = &h.orchestrator.history()[0];
    assert_eq!(finished.job_id, 1);
    assert_eq!(finished.state, JobStatus::Completed);
    assert_eq!(finished.retry_count, 2);
    assert_eq!(h.ejector.failed(), vec!["OTTOEJECT_HOME", "OTTOEJECT_HOME"]);
    assert_eq!(h.orchestrator.get_stats().retries, 2);
    assert!(h.store.shelf(1, 1).unwrap().occupied);
}

#[tokio::test]
async fn eject_failures_beyond_budget_fail_the_job_and_free_the_shelf() {
    let h = HarnessBuilder::new()
        .config(|c| c.retry_budget = 1)
        .printer(1, quick_script())
        .rack(1, Some(1), 2)
        .store(|s| s.add_job(job(1, 1).with_rack(1)))
        .start()
        .await;
    h.ejector.fail_next(5);

    h.orchestrator.tick().await;
    h.wait_for_status(1, JobStatus::Failed).await;
    h.wait_idle().await;

    let shelf = h.store.shelf(1, 1).unwrap();
    assert!(!shelf.occupied);
    assert_eq!(shelf.contents, None);
    // the part never left the bed
    assert_eq!(h.orchestrator.awaiting_bed_clear(), vec![1]);
}

#[tokio::test]
async fn disabling_lets_running_workflow_finish_but_dispatches_nothing_new() {
    let h = HarnessBuilder::new()
        .printer(1, medium_script())
        .rack(1, Some(1), 4)
        .store(|s| {
            s.add_job(job(1, 1).with_rack(1).with_priority(2));
            s.add_job(job(2, 1).with_rack(1));
        })
        .start()
        .await;

    h.orchestrator.tick().await;
    h.wait_for_status(1, JobStatus::Printing).await;
    h.orchestrator.disable_job_processing();

    h.wait_for_status(1, JobStatus::Completed).await;
    h.wait_idle().await;
    h.orchestrator.tick().await;
    assert_eq!(h.job_status(2), JobStatus::Queued);
    assert!(!h.orchestrator.trigger_job_processing());

    h.orchestrator.enable_job_processing();
    h.orchestrator.tick().await;
    h.wait_for_status(2, JobStatus::Completed).await;
}

#[tokio::test]
async fn concurrent_ticks_never_double_dispatch_a_printer() {
    let h = HarnessBuilder::new()
        .printer(1, long_script())
        .rack(1, Some(1), 4)
        .store(|s| {
            s.add_job(job(1, 1).with_rack(1));
            s.add_job(job(2, 1).with_rack(1));
        })
        .start()
        .await;

    let (a, b) = tokio::join!(h.orchestrator.tick(), h.orchestrator.tick());
    assert!(a || b);
    h.orchestrator.tick().await;
    assert!(h.orchestrator.trigger_job_processing());
    assert!(h.orchestrator.trigger_job_processing());
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(h.orchestrator.active_workflows().len(), 1);
    assert_eq!(h.orchestrator.get_stats().jobs_dispatched, 1);
    assert_eq!(h.printer(1).log().starts.len(), 1);
    assert_eq!(h.job_status(2), JobStatus::Queued);
}

#[tokio::test]
async fn cancel_while_printing_stops_the_printer_and_releases_the_shelf() {
    let h = HarnessBuilder::new()
        .printer(1, long_script())
        .rack(1, Some(1), 2)
        .store(|s| s.add_job(job(1, 1).with_rack(1)))
        .start()
        .await;

    h.orchestrator.tick().await;
    h.wait_for_status(1, JobStatus::Printing).await;
    assert_eq!(h.store.shelf(1, 1).unwrap().contents, Some(1));

    assert_eq!(h.orchestrator.cancel_job(1).await.unwrap(), CancelDisposition::Requested);
    h.wait_for_status(1, JobStatus::Cancelled).await;
    h.wait_idle().await;

    assert_eq!(h.printer(1).log().cancels, 1);
    assert_eq!(h.store.shelf(1, 1).unwrap().contents, None);
    assert!(h.ejector.executed().is_empty());
    assert_eq!(h.orchestrator.get_stats().jobs_cancelled, 1);
}

#[tokio::test]
async fn cancel_queued_job_is_immediate() {
    let h = HarnessBuilder::new()
        .printer(1, quick_script())
        .store(|s| s.add_job(job(1, 1)))
        .start()
        .await;

    assert_eq!(h.orchestrator.cancel_job(1).await.unwrap(), CancelDisposition::Cancelled);
    assert_eq!(h.job_status(1), JobStatus::Cancelled);
    h.orchestrator.tick().await;
    assert!(h.orchestrator.active_workflows().is_empty());
    assert!(h.printer(1).log().starts.is_empty());

    assert!(matches!(
        h.orchestrator.cancel_job(1).await,
        Err(OrchestratorError::AlreadyFinished { job_id: 1, status: JobStatus::Cancelled })
    ));
    assert!(matches!(h.orchestrator.cancel_job(99).await, Err(OrchestratorError::JobNotFound(99))));
}

#[tokio::test]
async fn printer_error_fails_the_job() {
    let h = HarnessBuilder::new()
        .printer(1, long_script())
        .rack(1, Some(1), 2)
        .store(|s| s.add_job(job(1, 1).with_rack(1)))
        .start()
        .await;

    h.orchestrator.tick().await;
    h.wait_for_status(1, JobStatus::Printing).await;
    h.printer(1).push_status(DeviceStatus::new(PrintState::Running).with_error_code("HMS_0300"));

    h.wait_for_status(1, JobStatus::Failed).await;
    h.wait_idle().await;
    let failed = h.store.job(1).unwrap();
    assert!(failed.status_message.unwrap().contains("HMS_0300"));
    assert_eq!(h.store.shelf(1, 1).unwrap().contents, None);
    assert!(h.ejector.executed().is_empty());
}

#[tokio::test]
async fn full_rack_defers_the_second_printer() {
    let h = HarnessBuilder::new()
        .printer(1, quick_script())
        .printer(2, quick_script())
        .rack(1, Some(1), 1)
        .store(|s| {
            s.add_job(job(1, 1).with_rack(1));
            s.add_job(job(2, 2).with_rack(1));
        })
        .start()
        .await;

    h.orchestrator.tick().await;
    // both printers are polled in the same pass; one of them gets the shelf
    let (winner, loser) = if h.job_status(2) == JobStatus::Queued { (1, 2) } else { (2, 1) };
    assert_eq!(h.job_status(loser), JobStatus::Queued);
    assert!(h.orchestrator.get_stats().jobs_deferred >= 1);

    h.wait_for_status(winner, JobStatus::Completed).await;
    h.wait_idle().await;
    h.orchestrator.tick().await;
    assert_eq!(h.job_status(loser), JobStatus::Queued);
    let shelf = h.store.shelf(1, 1).unwrap();
    assert_eq!((shelf.occupied, shelf.contents), (true, Some(winner)));
}

#[tokio::test]
async fn job_without_rack_waits_for_bed_clear() {
    let h = HarnessBuilder::new()
        .printer(1, quick_script())
        .store(|s| {
            s.add_job(job(1, 1).with_priority(1));
            s.add_job(job(2, 1));
        })
        .start()
        .await;

    h.orchestrator.tick().await;
    h.wait_for_status(1, JobStatus::Completed).await;
    h.wait_idle().await;
    assert_eq!(h.orchestrator.awaiting_bed_clear(), vec![1]);
    h.orchestrator.tick().await;
    assert_eq!(h.job_status(2), JobStatus::Queued);

    assert!(h.orchestrator.mark_bed_cleared(1));
    assert!(!h.orchestrator.mark_bed_cleared(1));
    h.wait_for_status(2, JobStatus::Completed).await;
}

#[tokio::test]
async fn rack_without_ottoeject_fails_at_dispatch() {
    let h = HarnessBuilder::new()
        .printer(1, quick_script())
        .rack(1, None, 2)
        .store(|s| s.add_job(job(1, 1).with_rack(1)))
        .start()
        .await;

    h.orchestrator.tick().await;
    assert_eq!(h.job_status(1), JobStatus::Failed);
    assert!(h.printer(1).log().starts.is_empty());
}

#[tokio::test]
async fn transient_start_failure_is_retried() {
    let h = HarnessBuilder::new()
        .printer(1, quick_script())
        .rack(1, Some(1), 2)
        .store(|s| s.add_job(job(1, 1).with_rack(1)))
        .start()
        .await;
    h.printer(1).fail_next_start(ottoflow::shared::AdapterError::Network("reset".to_string()));

    h.orchestrator.tick().await;
    h.wait_for_status(1, JobStatus::Completed).await;
    h.wait_idle().await;
    assert_eq!(h.orchestrator.history()[0].retry_count, 1);
}

#[tokio::test]
async fn restart_fails_interrupted_jobs_and_frees_their_shelves() {
    let h = HarnessBuilder::new()
        .printer(1, quick_script())
        .rack(1, Some(1), 2)
        .store(|s| {
            let mut interrupted = job(1, 1).with_rack(1);
            interrupted.status = JobStatus::Printing;
            s.add_job(interrupted);
            s.overwrite_shelf(1, 1, false, Some(1));
        })
        .start()
        .await;

    assert_eq!(h.job_status(1), JobStatus::Failed);
    assert_eq!(h.store.shelf(1, 1).unwrap().contents, None);
}

#[tokio::test]
async fn health_reflects_processing_and_repository() {
    let h = HarnessBuilder::new().printer(1, quick_script()).printer(2, quick_script()).start().await;

    assert_eq!(h.orchestrator.health_check().await.status, HealthState::Healthy);
    h.orchestrator.disable_job_processing();
    assert_eq!(h.orchestrator.health_check().await.status, HealthState::Degraded);
    h.orchestrator.enable_job_processing();

    h.store.set_unavailable(true);
    let report = h.orchestrator.health_check().await;
    assert_eq!(report.status, HealthState::Unhealthy);
    assert!(!report.repository_reachable);
}

#[tokio::test]
async fn control_loop_dispatches_on_its_own() {
    let h = HarnessBuilder::new()
        .printer(1, quick_script())
        .rack(1, Some(1), 2)
        .store(|s| s.add_job(job(1, 1).with_rack(1)))
        .start()
        .await;

    h.orchestrator.start().unwrap();
    h.wait_for_status(1, JobStatus::Completed).await;
    wait_for("a recorded tick", || h.orchestrator.get_stats().ticks > 0).await;
    h.orchestrator.shutdown().await;
    assert!(h.orchestrator.start().is_err());
}

#[tokio::test]
async fn printer_reporting_cancelled_takes_the_next_job() {
    let h = HarnessBuilder::new()
        .printer(1, long_script())
        .rack(1, Some(1), 2)
        .store(|s| s.add_job(job(1, 1).with_rack(1)))
        .start()
        .await;

    h.orchestrator.tick().await;
    h.wait_for_status(1, JobStatus::Printing).await;
    h.orchestrator.cancel_job(1).await.unwrap();
    h.wait_for_status(1, JobStatus::Cancelled).await;
    h.wait_idle().await;

    // Klipper keeps reporting the cancelled print until the next one starts
    let cancelled = parse_status(&json!({
        "print_stats": { "state": "cancelled", "filename": "part-1.gcode" }
    }));
    h.printer(1).push_status(cancelled);
    tokio::time::timeout(Duration::from_secs(2), async {
        while h.connections.get_status(1).await.current_file.is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    h.store.add_job(job(2, 1).with_rack(1));
    h.orchestrator.tick().await;
    h.wait_for_status(2, JobStatus::Completed).await;
    assert_eq!(h.printer(1).log().starts, vec!["part-1.gcode", "part-2.gcode"]);
}

#[tokio::test]
async fn hung_printer_does_not_hold_up_the_others() {
    let h = HarnessBuilder::new()
        .config(|c| c.command_timeout_ms = 3_000)
        .printer(1, quick_script())
        .printer(2, quick_script())
        .rack(1, Some(1), 2)
        .store(|s| s.add_job(job(20, 2).with_rack(1)))
        .start()
        .await;
    h.printer(1).set_status_delay(Duration::from_secs(10));

    let orchestrator = h.orchestrator.clone();
    let pass = tokio::spawn(async move { orchestrator.tick().await });
    tokio::time::timeout(Duration::from_millis(1_500), h.wait_for_status(20, JobStatus::Dispatching))
        .await
        .expect("printer 2 was dispatched while printer 1 hung");
    // the pass itself still waits out printer 1's poll
    assert!(!pass.is_finished());
    assert!(pass.await.unwrap());
    h.wait_for_status(20, JobStatus::Completed).await;
}

#[tokio::test]
async fn cancel_during_upload_never_starts_the_print() {
    let h = HarnessBuilder::new()
        .printer(1, quick_script())
        .rack(1, Some(1), 2)
        .store(|s| {
            s.add_job(PrintJob::new(1, 1, FileRef::local("part-1.gcode", "/tmp/part-1.gcode")).with_rack(1))
        })
        .start()
        .await;
    h.printer(1).set_command_delay(Duration::from_millis(500));

    h.orchestrator.tick().await;
    assert_eq!(h.job_status(1), JobStatus::Dispatching);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.orchestrator.cancel_job(1).await.unwrap(), CancelDisposition::Requested);

    h.wait_for_status(1, JobStatus::Cancelled).await;
    h.wait_idle().await;
    let log = h.printer(1).log();
    assert_eq!(log.uploads, vec!["part-1.gcode".to_string()]);
    assert!(log.starts.is_empty());
    assert!(!h.store.status_history(1).contains(&JobStatus::Printing));
    assert_eq!(h.store.shelf(1, 1).unwrap().contents, None);
}

#[tokio::test]
async fn cancel_while_start_is_in_flight_stops_the_print() {
    let h = HarnessBuilder::new()
        .printer(1, long_script())
        .rack(1, Some(1), 2)
        .store(|s| s.add_job(job(1, 1).with_rack(1)))
        .start()
        .await;
    h.printer(1).set_command_delay(Duration::from_millis(500));

    h.orchestrator.tick().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.orchestrator.cancel_job(1).await.unwrap(), CancelDisposition::Requested);

    h.wait_for_status(1, JobStatus::Cancelled).await;
    h.wait_idle().await;
    let log = h.printer(1).log();
    assert_eq!(log.starts, vec!["part-1.gcode".to_string()]);
    assert_eq!(log.cancels, 1);
    assert!(!h.store.status_history(1).contains(&JobStatus::Printing));
    assert_eq!(h.store.shelf(1, 1).unwrap().contents, None);
    assert_eq!(h.orchestrator.get_stats().jobs_cancelled, 1);
}

#[tokio::test]
async fn lost_status_feed_fails_the_print() {
    let h = HarnessBuilder::new()
        .config(|c| c.max_stream_reconnects = 0)
        .printer(1, long_script())
        .rack(1, Some(1), 2)
        .store(|s| s.add_job(job(1, 1).with_rack(1)))
        .start()
        .await;

    h.orchestrator.tick().await;
    h.wait_for_status(1, JobStatus::Printing).await;
    h.printer(1).drop_stream();

    h.wait_for_status(1, JobStatus::Failed).await;
    h.wait_idle().await;
    let failed = h.store.job(1).unwrap();
    assert!(failed.status_message.unwrap().contains("status feed"));
    assert_eq!(h.store.shelf(1, 1).unwrap().contents, None);
    assert!(h.ejector.executed().is_empty());
}

#[tokio::test]
async fn feed_drops_far_apart_do_not_exhaust_the_reconnects() {
    let h = HarnessBuilder::new()
        .config(|c| c.max_stream_reconnects = 1)
        .printer(1, long_script())
        .rack(1, Some(1), 2)
        .store(|s| s.add_job(job(1, 1).with_rack(1)))
        .start()
        .await;

    h.orchestrator.tick().await;
    h.wait_for_status(1, JobStatus::Printing).await;
    for round in 1..=2 {
        h.printer(1).drop_stream();
        wait_for("the printer to re-authenticate", || h.printer(1).log().auth_calls > round).await;
        // let the resumed feed deliver a few fresh updates
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(h.job_status(1), JobStatus::Printing);
    }

    h.wait_for_status(1, JobStatus::Completed).await;
    assert!(h.store.shelf(1, 1).unwrap().occupied);
}

#[tokio::test]
async fn completion_carrying_an_error_code_fails_the_job() {
    let h = HarnessBuilder::new()
        .printer(1, long_script())
        .rack(1, Some(1), 2)
        .store(|s| s.add_job(job(1, 1).with_rack(1)))
        .start()
        .await;

    h.orchestrator.tick().await;
    h.wait_for_status(1, JobStatus::Printing).await;
    h.printer(1).push_status(DeviceStatus::new(PrintState::Completed).with_error_code("E1"));

    h.wait_for_status(1, JobStatus::Failed).await;
    h.wait_idle().await;
    assert!(h.store.job(1).unwrap().status_message.unwrap().contains("E1"));
    assert!(!h.store.status_history(1).contains(&JobStatus::Completed));
    assert!(h.ejector.executed().is_empty());
    assert_eq!(h.store.shelf(1, 1).unwrap().contents, None);
}
