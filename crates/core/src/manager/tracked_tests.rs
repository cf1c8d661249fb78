use super::*;
use crate::clock::FakeClock;
use crate::package::{
    Accessor, AccessorId, ContainerId, ContainerRef, EndRequirement, MediaFileVersion,
    PackagePayload, StartRequirement, StatusReportSettings, WorkOptions,
};
use std::collections::HashMap as StdHashMap;
use yare::parameterized;

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
        container_id: ContainerId::from(id),
        label: id.to_string(),
        accessors,
    }
}

fn make_expectation(id: &str) -> Expectation {
    Expectation {
        id: ExpectationId::from(id),
        priority: 0,
        status_report: StatusReportSettings::default(),
        package: PackagePayload::MediaFile {
            file_path: "a.mp4".to_string(),
            version: MediaFileVersion::default(),
        },
        content_version_hash: "h1".to_string(),
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

fn make_tracked(clock: &FakeClock) -> TrackedExpectation {
    TrackedExpectation::new(make_expectation("exp1"), "defhash".to_string(), clock)
}

#[test]
fn new_tracked_expectation_starts_new_and_dirty() {
    let clock = FakeClock::new();
    let tracked = make_tracked(&clock);
    assert_eq!(tracked.state, ExpectationState::New);
    assert!(tracked.dirty);
    assert!(tracked.ready_for_evaluation(clock.now()));
}

#[test]
fn next_evaluation_gates_until_due_unless_dirty() {
    let clock = FakeClock::new();
    let mut tracked = make_tracked(&clock);
    tracked.dirty = false;
    tracked.next_evaluation = Some(clock.now() + Duration::from_secs(10));

    assert!(!tracked.ready_for_evaluation(clock.now()));

    tracked.dirty = true;
    assert!(tracked.ready_for_evaluation(clock.now()));

    tracked.dirty = false;
    clock.advance(Duration::from_secs(10));
    assert!(tracked.ready_for_evaluation(clock.now()));
}

#[test]
fn begin_evaluation_clears_session_scratch() {
    let clock = FakeClock::new();
    let mut tracked = make_tracked(&clock);
    tracked.session.assigned_worker = Some(WorkerId::from("w1"));
    tracked.session.trigger_other_expectations_again = true;

    tracked.begin_evaluation(clock.now(), Duration::from_secs(10));

    assert!(tracked.session.assigned_worker.is_none());
    assert!(!tracked.session.trigger_other_expectations_again);
    assert!(!tracked.dirty);
    assert!(tracked.last_evaluation.is_some());
}

#[test]
fn availability_answers_replace_each_other() {
    let clock = FakeClock::new();
    let mut tracked = make_tracked(&clock);
    let worker = WorkerId::from("w1");
    let ttl = Duration::from_secs(60);

    tracked.remember_available(worker.clone(), clock.now(), ttl, 3.0);
    assert!(tracked.available_workers.contains_key(&worker));
    assert_eq!(tracked.worker_costs.get(&worker), Some(&3.0));

    tracked.remember_unavailable(worker.clone(), clock.now(), ttl);
    assert!(!tracked.available_workers.contains_key(&worker));
    assert!(tracked.unavailable_workers.contains_key(&worker));
    assert!(!tracked.worker_costs.contains_key(&worker));
}

#[test]
fn cached_answers_expire() {
    let clock = FakeClock::new();
    let mut tracked = make_tracked(&clock);
    let worker = WorkerId::from("w1");

    tracked.remember_available(worker.clone(), clock.now(), Duration::from_secs(60), 1.0);
    tracked.remember_unavailable(
        WorkerId::from("w2"),
        clock.now(),
        Duration::from_secs(10),
    );
    tracked.note_queried(worker.clone(), clock.now());

    clock.advance(Duration::from_secs(30));
    tracked.prune_worker_caches(clock.now(), Duration::from_secs(20));

    // Positive cache still valid, negative expired, query record expired
    assert!(tracked.available_workers.contains_key(&worker));
    assert!(tracked.unavailable_workers.is_empty());
    assert!(tracked.queried_workers.is_empty());

    clock.advance(Duration::from_secs(31));
    tracked.prune_worker_caches(clock.now(), Duration::from_secs(20));
    assert!(tracked.available_workers.is_empty());
    assert!(tracked.worker_costs.is_empty());
}

#[test]
fn recently_queried_rate_limits_probes() {
    let clock = FakeClock::new();
    let mut tracked = make_tracked(&clock);
    let worker = WorkerId::from("w1");
    let interval = Duration::from_secs(10);

    assert!(!tracked.recently_queried(&worker, clock.now(), interval));
    tracked.note_queried(worker.clone(), clock.now());
    assert!(tracked.recently_queried(&worker, clock.now(), interval));

    clock.advance(Duration::from_secs(11));
    assert!(!tracked.recently_queried(&worker, clock.now(), interval));
}

#[test]
fn record_error_counts_and_schedules_retry() {
    let clock = FakeClock::new();
    let cfg = ManagerConfig::default();
    let mut tracked = make_tracked(&clock);

    tracked.record_error(Reason::user_only("copy failed"), &cfg, clock.now());

    assert_eq!(tracked.error_count, 1);
    assert!(tracked.last_error.is_some());
    let due = tracked.next_evaluation.expect("retry scheduled");
    assert!(due > clock.now());

    tracked.reset_errors();
    assert_eq!(tracked.error_count, 0);
    assert!(tracked.last_error.is_none());
}

#[test]
fn forget_worker_drops_all_memory() {
    let clock = FakeClock::new();
    let mut tracked = make_tracked(&clock);
    let worker = WorkerId::from("w1");

    tracked.remember_available(worker.clone(), clock.now(), Duration::from_secs(60), 1.0);
    tracked.note_queried(worker.clone(), clock.now());
    tracked.forget_worker(&worker);

    assert!(tracked.available_workers.is_empty());
    assert!(tracked.queried_workers.is_empty());
    assert!(tracked.worker_costs.is_empty());
}

#[parameterized(
    first_error = { 1 },
    fifth_error = { 5 },
    runaway = { 30 },
)]
fn backoff_is_bounded(error_count: u32) {
    let cfg = ManagerConfig::default();
    let delay = backoff_delay(&cfg, error_count, &ExpectationId::from("exp1"));
    assert!(delay >= cfg.error_backoff_base);
    // Cap plus at most 25% jitter
    assert!(delay <= cfg.error_backoff_max + cfg.error_backoff_max / 4);
}

#[test]
fn backoff_grows_with_error_count() {
    let cfg = ManagerConfig::default();
    let id = ExpectationId::from("exp1");
    let first = backoff_delay(&cfg, 1, &id);
    let third = backoff_delay(&cfg, 3, &id);
    assert!(third > first);
}

#[test]
fn backoff_jitter_is_deterministic_per_id() {
    let cfg = ManagerConfig::default();
    let a = backoff_delay(&cfg, 1, &ExpectationId::from("exp-a"));
    assert_eq!(a, backoff_delay(&cfg, 1, &ExpectationId::from("exp-a")));
}

#[test]
fn eval_class_puts_fulfilled_first_and_aborted_last() {
    assert!(ExpectationState::Fulfilled.eval_class() < ExpectationState::Working.eval_class());
    assert!(ExpectationState::Working.eval_class() < ExpectationState::New.eval_class());
    assert!(ExpectationState::New.eval_class() < ExpectationState::Aborted.eval_class());
}

#[test]
fn pipeline_rank_orders_forward_states() {
    assert!(
        ExpectationState::New.pipeline_rank().unwrap()
            < ExpectationState::Fulfilled.pipeline_rank().unwrap()
    );
    assert!(ExpectationState::Removed.pipeline_rank().is_none());
    assert!(ExpectationState::Removed.is_side_state());
    assert!(!ExpectationState::Working.is_side_state());
}
