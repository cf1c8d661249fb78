// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The manager's live record of one expectation
//!
//! A tracked expectation wraps the immutable upstream definition with its
//! runtime state: where it is in the lifecycle, what workers have said about
//! it, what work is running, and how often it has failed.

use crate::clock::Clock;
use crate::config::ManagerConfig;
use crate::package::{Expectation, ExpectationId};
use crate::reason::Reason;
use crate::worker::{WorkInProgressId, WorkerId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Lifecycle state of a tracked expectation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExpectationState {
    /// Just ingested, or reset; dependencies and worker support unknown
    New,
    /// At least one worker supports it; waiting to become startable
    Waiting,
    /// A worker is assigned and ready to start
    Ready,
    /// Work is running on the assigned worker
    Working,
    /// The targets carry the expected content version
    Fulfilled,
    /// Upstream no longer wants it; removal work may run before deletion
    Removed,
    /// The definition changed; running work is aborted, then back to New
    Restarted,
    /// Parked until upstream removes or updates the expectation
    Aborted,
}

impl ExpectationState {
    /// Order within a priority band: cheapest evaluations first, so that a
    /// failed re-verification frees capacity before waiting items probe
    pub fn eval_class(&self) -> u8 {
        match self {
            ExpectationState::Fulfilled => 0,
            ExpectationState::Working => 1,
            ExpectationState::Ready => 2,
            ExpectationState::Waiting => 3,
            ExpectationState::New => 4,
            ExpectationState::Removed => 5,
            ExpectationState::Restarted => 6,
            ExpectationState::Aborted => 7,
        }
    }

    /// Position along the forward pipeline, if this state is on it
    pub fn pipeline_rank(&self) -> Option<u8> {
        match self {
            ExpectationState::New => Some(0),
            ExpectationState::Waiting => Some(1),
            ExpectationState::Ready => Some(2),
            ExpectationState::Working => Some(3),
            ExpectationState::Fulfilled => Some(4),
            _ => None,
        }
    }

    /// States outside the forward pipeline; errors here must not resurrect
    /// the expectation into New
    pub fn is_side_state(&self) -> bool {
        matches!(
            self,
            ExpectationState::Removed | ExpectationState::Restarted | ExpectationState::Aborted
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExpectationState::New => "NEW",
            ExpectationState::Waiting => "WAITING",
            ExpectationState::Ready => "READY",
            ExpectationState::Working => "WORKING",
            ExpectationState::Fulfilled => "FULFILLED",
            ExpectationState::Removed => "REMOVED",
            ExpectationState::Restarted => "RESTARTED",
            ExpectationState::Aborted => "ABORTED",
        }
    }
}

impl std::fmt::Display for ExpectationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// What the manager currently knows about the package itself
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpectationStatus {
    pub source_exists: Option<bool>,
    pub target_exists: Option<bool>,
    pub work_progress: Option<f64>,
    pub actual_version_hash: Option<String>,
}

/// Per-evaluation scratch, cleared when an evaluation begins
#[derive(Debug, Clone, Default)]
pub struct SessionScratch {
    pub assigned_worker: Option<WorkerId>,
    /// Fan dependents out on this tick instead of the next
    pub trigger_other_expectations_again: bool,
    /// Removal work finished; the record can be dropped
    pub expectation_can_be_removed: bool,
}

/// A tracked expectation: definition plus runtime state
#[derive(Debug, Clone)]
pub struct TrackedExpectation {
    pub exp: Arc<Expectation>,
    /// Canonical hash of the definition, for change detection at ingest
    pub def_hash: String,
    pub state: ExpectationState,
    pub reason: Reason,
    pub is_error: bool,
    pub status: ExpectationStatus,

    pub dirty: bool,
    pub last_evaluation: Option<Instant>,
    /// When the next evaluation is due; `None` means due now
    pub next_evaluation: Option<Instant>,

    /// Workers that said they support this expectation, with cache expiry
    pub available_workers: HashMap<WorkerId, Instant>,
    /// Workers that said they do not, with (shorter) cache expiry
    pub unavailable_workers: HashMap<WorkerId, Instant>,
    /// When each worker was last asked, to rate-limit probes
    pub queried_workers: HashMap<WorkerId, Instant>,
    /// Last reported cost per supporting worker
    pub worker_costs: HashMap<WorkerId, f64>,
    pub no_worker_reason: Option<Reason>,

    pub assigned_worker: Option<WorkerId>,
    pub work_in_progress: Option<WorkInProgressId>,
    pub last_job_update: Option<Instant>,
    /// Worker that last fulfilled the expectation; preferred for re-verify
    pub fulfilled_by: Option<WorkerId>,

    pub error_count: u32,
    pub last_error: Option<Reason>,

    pub session: SessionScratch,
}

impl TrackedExpectation {
    pub fn new(exp: Expectation, def_hash: String, _clock: &impl Clock) -> Self {
        Self {
            exp: Arc::new(exp),
            def_hash,
            state: ExpectationState::New,
            reason: Reason::user_only("Not yet evaluated"),
            is_error: false,
            status: ExpectationStatus::default(),
            dirty: true,
            last_evaluation: None,
            next_evaluation: None,
            available_workers: HashMap::new(),
            unavailable_workers: HashMap::new(),
            queried_workers: HashMap::new(),
            worker_costs: HashMap::new(),
            no_worker_reason: None,
            assigned_worker: None,
            work_in_progress: None,
            last_job_update: None,
            fulfilled_by: None,
            error_count: 0,
            last_error: None,
            session: SessionScratch::default(),
        }
    }

    pub fn id(&self) -> &ExpectationId {
        &self.exp.id
    }

    pub fn priority(&self) -> i32 {
        self.exp.priority
    }

    /// Whether the evaluation loop should look at this expectation now
    pub fn ready_for_evaluation(&self, now: Instant) -> bool {
        self.dirty || self.next_evaluation.map_or(true, |due| due <= now)
    }

    /// Start an evaluation: clear scratch, drop expired worker memory
    pub fn begin_evaluation(&mut self, now: Instant, queried_ttl: Duration) {
        self.session = SessionScratch::default();
        self.dirty = false;
        self.last_evaluation = Some(now);
        self.next_evaluation = None;
        self.prune_worker_caches(now, queried_ttl);
    }

    pub fn remember_available(&mut self, worker: WorkerId, now: Instant, ttl: Duration, cost: f64) {
        self.unavailable_workers.remove(&worker);
        self.worker_costs.insert(worker.clone(), cost);
        self.available_workers.insert(worker, now + ttl);
    }

    pub fn remember_unavailable(&mut self, worker: WorkerId, now: Instant, ttl: Duration) {
        self.available_workers.remove(&worker);
        self.worker_costs.remove(&worker);
        self.unavailable_workers.insert(worker, now + ttl);
    }

    pub fn note_queried(&mut self, worker: WorkerId, now: Instant) {
        self.queried_workers.insert(worker, now);
    }

    pub fn recently_queried(&self, worker: &WorkerId, now: Instant, interval: Duration) -> bool {
        self.queried_workers
            .get(worker)
            .is_some_and(|asked| now.duration_since(*asked) < interval)
    }

    /// Expire cached worker answers so disconnects and stale probes cannot
    /// permanently exclude a worker
    pub fn prune_worker_caches(&mut self, now: Instant, queried_ttl: Duration) {
        self.available_workers.retain(|_, expiry| *expiry > now);
        self.unavailable_workers.retain(|_, expiry| *expiry > now);
        self.queried_workers
            .retain(|_, asked| now.duration_since(*asked) < queried_ttl);
        self.worker_costs
            .retain(|worker, _| self.available_workers.contains_key(worker));
    }

    /// Drop everything remembered about a worker (it disconnected)
    pub fn forget_worker(&mut self, worker: &WorkerId) {
        self.available_workers.remove(worker);
        self.unavailable_workers.remove(worker);
        self.queried_workers.remove(worker);
        self.worker_costs.remove(worker);
    }

    /// Clear work bookkeeping when leaving an assigned state
    pub fn clear_work(&mut self) {
        self.assigned_worker = None;
        self.work_in_progress = None;
        self.last_job_update = None;
    }

    /// Count an error against this expectation and schedule the retry
    pub fn record_error(&mut self, reason: Reason, cfg: &ManagerConfig, now: Instant) {
        self.error_count += 1;
        self.last_error = Some(reason);
        self.next_evaluation = Some(now + backoff_delay(cfg, self.error_count, self.id()));
    }

    pub fn reset_errors(&mut self) {
        self.error_count = 0;
        self.last_error = None;
    }
}

/// Exponential backoff with a deterministic jitter derived from the id, so
/// a burst of failing expectations does not retry in lockstep
pub fn backoff_delay(cfg: &ManagerConfig, error_count: u32, id: &ExpectationId) -> Duration {
    let exponent = error_count.min(16);
    let exponential = cfg
        .error_backoff_base
        .saturating_mul(2u32.saturating_pow(exponent));
    let delay = exponential.min(cfg.error_backoff_max);

    let jitter_range = (delay / 4).as_millis() as u64;
    if jitter_range == 0 {
        return delay;
    }
    let jitter = {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        error_count.hash(&mut hasher);
        hasher.finish() % jitter_range
    };
    delay + Duration::from_millis(jitter)
}

#[cfg(test)]
#[path = "tracked_tests.rs"]
mod tests;
