use super::*;
use crate::clock::FakeClock;
use crate::manager::ExpectationStatus;
use crate::package::{
    Accessor, AccessorId, ContainerRef, EndRequirement, MediaFileVersion, PackagePayload,
    StartRequirement, StatusReportSettings, WorkOptions,
};
use crate::upstream::FakeUpstream;
use crate::worker::{FakeWorker, WorkerCall};
use std::collections::HashMap as StdHashMap;
use std::time::Duration;

fn folder_ref(id: &str, read: bool, write: bool) -> ContainerRef {
    let mut accessors = StdHashMap::new();
    accessors.insert(
        AccessorId::from("folder"),
        Accessor::LocalFolder {
            folder_path: format!("/{id}"),
            allow_read: read,
            allow_write: write,
        },
    );
    ContainerRef {
        container_id: crate::package::ContainerId::from(id),
        label: id.to_string(),
        accessors,
    }
}

fn media_expectation(id: &str, priority: i32) -> Expectation {
    Expectation {
        id: ExpectationId::from(id),
        priority,
        status_report: StatusReportSettings::default(),
        package: PackagePayload::MediaFile {
            file_path: format!("{id}.mp4"),
            version: MediaFileVersion::default(),
        },
        content_version_hash: format!("hash-{id}"),
        start_requirement: StartRequirement {
            sources: vec![folder_ref("src", true, false)],
        },
        end_requirement: EndRequirement {
            targets: vec![folder_ref("dst", false, true)],
        },
        work_options: WorkOptions::default(),
        depends_on_fulfilled: vec![],
        trigger_by_fulfilled_ids: vec![],
    }
}

fn make_manager() -> (ExpectationManager<FakeClock>, FakeClock, FakeUpstream) {
    let clock = FakeClock::new();
    let upstream = FakeUpstream::new();
    let manager = ExpectationManager::new(
        ManagerId::from("em-1"),
        ManagerConfig::for_testing(),
        Arc::new(upstream.clone()),
        clock.clone(),
    );
    (manager, clock, upstream)
}

fn connect_auto_worker(manager: &mut ExpectationManager<FakeClock>, id: &str) -> FakeWorker {
    let worker = FakeWorker::new(id);
    worker.set_auto_complete(true);
    worker.connect_job_channel(manager.job_update_sender());
    manager.connect_worker(Arc::new(worker.clone()));
    worker
}

async fn tick_checked(manager: &mut ExpectationManager<FakeClock>) {
    manager.tick().await;
    manager.verify_invariants().expect("invariants hold");
}

#[tokio::test]
async fn ingest_inserts_and_publishes_new_state() {
    let (mut manager, _clock, upstream) = make_manager();

    manager.ingest_expectations(vec![media_expectation("e1", 0)]);
    assert_eq!(
        manager.expectation_state(&ExpectationId::from("e1")),
        Some(ExpectationState::New)
    );

    manager.tick().await;
    assert_eq!(
        upstream.states_for("e1").first(),
        Some(&ExpectationState::New)
    );
}

#[tokio::test]
async fn expectation_walks_the_pipeline_to_fulfilled() {
    let (mut manager, _clock, upstream) = make_manager();
    connect_auto_worker(&mut manager, "w1");

    manager.ingest_expectations(vec![media_expectation("e1", 0)]);

    let id = ExpectationId::from("e1");
    tick_checked(&mut manager).await;
    assert_eq!(manager.expectation_state(&id), Some(ExpectationState::Waiting));
    tick_checked(&mut manager).await;
    assert_eq!(manager.expectation_state(&id), Some(ExpectationState::Ready));
    tick_checked(&mut manager).await;
    assert_eq!(manager.expectation_state(&id), Some(ExpectationState::Working));
    tick_checked(&mut manager).await;
    assert_eq!(
        manager.expectation_state(&id),
        Some(ExpectationState::Fulfilled)
    );

    let tracked = manager.tracked(&id).unwrap();
    assert_eq!(
        tracked.status.actual_version_hash.as_deref(),
        Some("hash-e1")
    );
    assert_eq!(tracked.error_count, 0);

    // Upstream saw the causal order for this id. NEW coalesced away inside
    // the first publication window; the rest arrive in order.
    let states = upstream.states_for("e1");
    assert_eq!(states.last(), Some(&ExpectationState::Fulfilled));
    let positions: Vec<usize> = [
        ExpectationState::Waiting,
        ExpectationState::Working,
        ExpectationState::Fulfilled,
    ]
    .iter()
    .map(|wanted| states.iter().position(|s| s == wanted).unwrap())
    .collect();
    assert!(positions.windows(2).all(|pair| pair[0] < pair[1]));
}

#[tokio::test]
async fn unsupported_expectation_stays_new_with_reason() {
    let (mut manager, _clock, _upstream) = make_manager();
    let worker = FakeWorker::new("w1");
    worker.set_support(false);
    manager.connect_worker(Arc::new(worker));

    manager.ingest_expectations(vec![media_expectation("e1", 0)]);
    let id = ExpectationId::from("e1");

    for _ in 0..3 {
        tick_checked(&mut manager).await;
        assert_eq!(manager.expectation_state(&id), Some(ExpectationState::New));
    }
    let tracked = manager.tracked(&id).unwrap();
    assert_eq!(tracked.reason.user, "No worker supports this Expectation");
}

#[tokio::test]
async fn worker_reported_job_error_counts_and_backs_off() {
    let (mut manager, clock, _upstream) = make_manager();
    let worker = FakeWorker::new("w1");
    worker.connect_job_channel(manager.job_update_sender());
    manager.connect_worker(Arc::new(worker.clone()));

    manager.ingest_expectations(vec![media_expectation("e1", 0)]);
    let id = ExpectationId::from("e1");

    for _ in 0..3 {
        tick_checked(&mut manager).await;
    }
    assert_eq!(manager.expectation_state(&id), Some(ExpectationState::Working));

    let (wip, _) = worker.active_jobs().pop().unwrap();
    worker.fail_job(&wip, Reason::user_only("disk full"));
    tick_checked(&mut manager).await;

    let tracked = manager.tracked(&id).unwrap();
    assert_eq!(tracked.state, ExpectationState::New);
    assert_eq!(tracked.error_count, 1);
    assert!(tracked.is_error);
    let due = tracked.next_evaluation.expect("backoff scheduled");
    assert!(due > clock.now());

    // Not retried until the backoff elapses
    tick_checked(&mut manager).await;
    assert_eq!(manager.expectation_state(&id), Some(ExpectationState::New));

    clock.advance(Duration::from_secs(1));
    tick_checked(&mut manager).await;
    assert_eq!(
        manager.expectation_state(&id),
        Some(ExpectationState::Waiting)
    );
}

#[tokio::test]
async fn worker_disconnect_mid_work_reverts_without_error_count() {
    let (mut manager, _clock, _upstream) = make_manager();
    let worker = FakeWorker::new("w1");
    worker.connect_job_channel(manager.job_update_sender());
    manager.connect_worker(Arc::new(worker.clone()));

    manager.ingest_expectations(vec![media_expectation("e1", 0)]);
    let id = ExpectationId::from("e1");
    for _ in 0..3 {
        tick_checked(&mut manager).await;
    }
    assert_eq!(manager.expectation_state(&id), Some(ExpectationState::Working));

    manager.disconnect_worker(&crate::worker::WorkerId::from("w1"));

    let tracked = manager.tracked(&id).unwrap();
    assert_eq!(tracked.state, ExpectationState::New);
    assert_eq!(tracked.error_count, 0);
    assert!(tracked.assigned_worker.is_none());
    manager.verify_invariants().unwrap();
}

#[tokio::test]
async fn heartbeat_lapse_disconnects_the_worker() {
    let (mut manager, clock, _upstream) = make_manager();
    let worker = FakeWorker::new("w1");
    worker.connect_job_channel(manager.job_update_sender());
    manager.connect_worker(Arc::new(worker.clone()));

    manager.ingest_expectations(vec![media_expectation("e1", 0)]);
    let id = ExpectationId::from("e1");
    for _ in 0..3 {
        tick_checked(&mut manager).await;
    }
    assert_eq!(manager.expectation_state(&id), Some(ExpectationState::Working));

    // Quiet worker: no heartbeats, no job events
    clock.advance(Duration::from_secs(6));
    tick_checked(&mut manager).await;

    assert_eq!(manager.expectation_state(&id), Some(ExpectationState::New));
    assert_eq!(manager.connected_worker_count(), 0);
    assert_eq!(manager.tracked(&id).unwrap().error_count, 0);
}

#[tokio::test]
async fn reverification_failure_returns_to_new() {
    let (mut manager, clock, upstream) = make_manager();
    let worker = connect_auto_worker(&mut manager, "w1");

    manager.ingest_expectations(vec![media_expectation("e1", 0)]);
    let id = ExpectationId::from("e1");
    for _ in 0..4 {
        tick_checked(&mut manager).await;
    }
    assert_eq!(
        manager.expectation_state(&id),
        Some(ExpectationState::Fulfilled)
    );

    // Re-verify keeps it fulfilled while the package is there
    clock.advance(Duration::from_secs(2));
    tick_checked(&mut manager).await;
    assert_eq!(
        manager.expectation_state(&id),
        Some(ExpectationState::Fulfilled)
    );
    assert!(worker
        .calls()
        .iter()
        .any(|c| matches!(c, WorkerCall::IsFulfilled { was_fulfilled: true, .. })));

    // The package vanishes from the target
    worker.clear_fulfilled(&id);
    clock.advance(Duration::from_secs(2));
    tick_checked(&mut manager).await;
    assert_eq!(manager.expectation_state(&id), Some(ExpectationState::New));
    assert_eq!(manager.tracked(&id).unwrap().error_count, 0);

    // And the pipeline runs again to fulfilled
    for _ in 0..4 {
        tick_checked(&mut manager).await;
    }
    assert_eq!(
        manager.expectation_state(&id),
        Some(ExpectationState::Fulfilled)
    );
    let states = upstream.states_for("e1");
    let fulfills = states
        .iter()
        .filter(|s| **s == ExpectationState::Fulfilled)
        .count();
    assert!(fulfills >= 2);
}

#[tokio::test]
async fn removed_expectation_runs_removal_work_and_drops() {
    let (mut manager, _clock, _upstream) = make_manager();
    let worker = connect_auto_worker(&mut manager, "w1");

    manager.ingest_expectations(vec![media_expectation("e1", 0)]);
    let id = ExpectationId::from("e1");
    for _ in 0..4 {
        tick_checked(&mut manager).await;
    }
    assert_eq!(
        manager.expectation_state(&id),
        Some(ExpectationState::Fulfilled)
    );

    manager.ingest_expectations(vec![]);
    assert_eq!(manager.expectation_state(&id), Some(ExpectationState::Removed));

    tick_checked(&mut manager).await;
    assert_eq!(manager.expectation_state(&id), None);
    assert!(worker
        .calls()
        .iter()
        .any(|c| matches!(c, WorkerCall::RemoveExpectation { .. })));
}

#[tokio::test]
async fn changed_definition_restarts_and_cancels_running_work() {
    let (mut manager, _clock, _upstream) = make_manager();
    let worker = FakeWorker::new("w1");
    worker.connect_job_channel(manager.job_update_sender());
    manager.connect_worker(Arc::new(worker.clone()));

    manager.ingest_expectations(vec![media_expectation("e1", 0)]);
    let id = ExpectationId::from("e1");
    for _ in 0..3 {
        tick_checked(&mut manager).await;
    }
    assert_eq!(manager.expectation_state(&id), Some(ExpectationState::Working));

    let mut changed = media_expectation("e1", 0);
    changed.content_version_hash = "hash-v2".to_string();
    manager.ingest_expectations(vec![changed]);
    assert_eq!(
        manager.expectation_state(&id),
        Some(ExpectationState::Restarted)
    );

    tick_checked(&mut manager).await;
    assert_eq!(manager.expectation_state(&id), Some(ExpectationState::New));
    assert!(worker
        .calls()
        .iter()
        .any(|c| matches!(c, WorkerCall::CancelWork { .. })));
    let tracked = manager.tracked(&id).unwrap();
    assert_eq!(tracked.status, ExpectationStatus::default());
    assert_eq!(tracked.error_count, 0);
}

#[tokio::test]
async fn abort_parks_the_expectation() {
    let (mut manager, _clock, _upstream) = make_manager();
    let worker = FakeWorker::new("w1");
    worker.connect_job_channel(manager.job_update_sender());
    manager.connect_worker(Arc::new(worker.clone()));

    manager.ingest_expectations(vec![media_expectation("e1", 0)]);
    let id = ExpectationId::from("e1");
    for _ in 0..3 {
        tick_checked(&mut manager).await;
    }

    assert!(manager.abort_expectation(&id));
    tick_checked(&mut manager).await;
    assert_eq!(manager.expectation_state(&id), Some(ExpectationState::Aborted));
    assert!(worker
        .calls()
        .iter()
        .any(|c| matches!(c, WorkerCall::CancelWork { .. })));

    // Terminal until upstream changes something
    tick_checked(&mut manager).await;
    assert_eq!(manager.expectation_state(&id), Some(ExpectationState::Aborted));
}

#[tokio::test]
async fn invalid_expectation_is_aborted_with_error() {
    let (mut manager, _clock, _upstream) = make_manager();
    connect_auto_worker(&mut manager, "w1");

    let mut invalid = media_expectation("e1", 0);
    invalid.start_requirement.sources.clear();
    manager.ingest_expectations(vec![invalid]);

    tick_checked(&mut manager).await;
    let tracked = manager.tracked(&ExpectationId::from("e1")).unwrap();
    assert_eq!(tracked.state, ExpectationState::Aborted);
    assert!(tracked.is_error);
}

#[tokio::test]
async fn wrong_version_hash_from_worker_is_rejected() {
    let (mut manager, _clock, _upstream) = make_manager();
    let worker = FakeWorker::new("w1");
    worker.connect_job_channel(manager.job_update_sender());
    manager.connect_worker(Arc::new(worker.clone()));

    manager.ingest_expectations(vec![media_expectation("e1", 0)]);
    let id = ExpectationId::from("e1");
    for _ in 0..3 {
        tick_checked(&mut manager).await;
    }

    let (wip, _) = worker.active_jobs().pop().unwrap();
    worker.complete_job_with(&wip, "some-other-hash");
    tick_checked(&mut manager).await;

    let tracked = manager.tracked(&id).unwrap();
    assert_eq!(tracked.state, ExpectationState::New);
    assert_eq!(tracked.error_count, 1);
}

#[tokio::test]
async fn progress_events_surface_in_status() {
    let (mut manager, clock, upstream) = make_manager();
    let worker = FakeWorker::new("w1");
    worker.connect_job_channel(manager.job_update_sender());
    manager.connect_worker(Arc::new(worker.clone()));

    manager.ingest_expectations(vec![media_expectation("e1", 0)]);
    for _ in 0..3 {
        tick_checked(&mut manager).await;
    }

    let (wip, _) = worker.active_jobs().pop().unwrap();
    worker.push_progress(&wip, 0.4);
    clock.advance(Duration::from_millis(20));
    tick_checked(&mut manager).await;

    let tracked = manager.tracked(&ExpectationId::from("e1")).unwrap();
    assert_eq!(tracked.status.work_progress, Some(0.4));
    let last = upstream.records_for("e1").last().cloned().unwrap();
    assert_eq!(last.progress, Some(0.4));
    assert_eq!(last.state, ExpectationState::Working);
}

#[tokio::test]
async fn priority_bias_gives_capacity_to_urgent_work_first() {
    let (mut manager, _clock, _upstream) = make_manager();
    let worker = FakeWorker::new("w1");
    worker.set_concurrency_limit(1);
    worker.connect_job_channel(manager.job_update_sender());
    manager.connect_worker(Arc::new(worker.clone()));

    manager.ingest_expectations(vec![
        media_expectation("exp-lo", 10),
        media_expectation("exp-hi", 1),
    ]);

    for _ in 0..3 {
        tick_checked(&mut manager).await;
    }

    assert_eq!(
        manager.expectation_state(&ExpectationId::from("exp-hi")),
        Some(ExpectationState::Working)
    );
    // The lower-priority item is parked while the only worker is busy
    let lo = manager.tracked(&ExpectationId::from("exp-lo")).unwrap();
    assert_eq!(lo.state, ExpectationState::Waiting);

    // Capacity frees up, the low-priority item proceeds
    let (wip, _) = worker.active_jobs().pop().unwrap();
    worker.complete_job(&wip);
    for _ in 0..3 {
        tick_checked(&mut manager).await;
    }
    assert_eq!(
        manager.expectation_state(&ExpectationId::from("exp-lo")),
        Some(ExpectationState::Working)
    );
}

#[tokio::test]
async fn container_duties_are_delegated_and_run() {
    let (mut manager, clock, upstream) = make_manager();
    let worker = connect_auto_worker(&mut manager, "w1");

    let mut accessors = StdHashMap::new();
    accessors.insert(
        AccessorId::from("folder"),
        Accessor::LocalFolder {
            folder_path: "/media".to_string(),
            allow_read: true,
            allow_write: true,
        },
    );
    manager.ingest_containers(vec![crate::package::PackageContainer {
        id: crate::package::ContainerId::from("c1"),
        label: "media".to_string(),
        accessors,
    }]);

    tick_checked(&mut manager).await;
    let container = manager
        .container(&crate::package::ContainerId::from("c1"))
        .unwrap();
    assert!(container.monitors_set_up);
    assert!(container.last_cron_run.is_some());
    assert_eq!(container.status_ok, Some(true));
    assert!(worker
        .calls()
        .iter()
        .any(|c| matches!(c, WorkerCall::SetupContainerMonitors { .. })));
    assert_eq!(upstream.container_records().len(), 1);

    // Cron runs again after the cadence, not before
    worker.clear_calls();
    tick_checked(&mut manager).await;
    assert!(!worker
        .calls()
        .iter()
        .any(|c| matches!(c, WorkerCall::RunContainerCron { .. })));

    clock.advance(Duration::from_secs(2));
    tick_checked(&mut manager).await;
    assert!(worker
        .calls()
        .iter()
        .any(|c| matches!(c, WorkerCall::RunContainerCron { .. })));
}

#[tokio::test]
async fn fulfilled_dependency_wakes_dependents_same_tick() {
    let (mut manager, _clock, _upstream) = make_manager();
    connect_auto_worker(&mut manager, "w1");

    let mut dependent = media_expectation("exp1", 5);
    dependent.depends_on_fulfilled = vec![ExpectationId::from("exp0")];
    manager.ingest_expectations(vec![media_expectation("exp0", 1), dependent]);

    let dep_id = ExpectationId::from("exp1");

    // exp1 cannot leave NEW while exp0 is unfinished
    tick_checked(&mut manager).await;
    assert_eq!(
        manager.expectation_state(&dep_id),
        Some(ExpectationState::New)
    );
    let tracked = manager.tracked(&dep_id).unwrap();
    assert!(tracked.reason.user.contains("exp0"));

    for _ in 0..4 {
        tick_checked(&mut manager).await;
    }
    assert_eq!(
        manager.expectation_state(&ExpectationId::from("exp0")),
        Some(ExpectationState::Fulfilled)
    );
    // The dependent was re-evaluated promptly once the dependency landed
    assert_ne!(
        manager.expectation_state(&dep_id),
        Some(ExpectationState::New)
    );

    for _ in 0..4 {
        tick_checked(&mut manager).await;
    }
    assert_eq!(
        manager.expectation_state(&dep_id),
        Some(ExpectationState::Fulfilled)
    );
}
