// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The expectation manager: a single-task cooperative evaluation loop
//!
//! One tick walks every due expectation in snapshot order and advances each
//! by at most one step. Evaluations suspend only at remote calls; the
//! tracked table is owned by the loop and mutated nowhere else, so there is
//! nothing to lock. Parallelism lives in the workers: many expectations can
//! be WORKING at once, each on its own worker.

use super::containers::{ContainerDefer, ContainerStore};
use super::evaluate::EvalOutcome;
use super::selection::ProbeDefer;
use super::status::{StatusPublisher, StatusRecord};
use super::store::{ExpectationStore, IngestChange};
use super::tracked::{ExpectationState, TrackedExpectation};
use super::ManagerId;
use crate::clock::Clock;
use crate::config::ManagerConfig;
use crate::error::EvalError;
use crate::package::{Expectation, ExpectationId, PackageContainer};
use crate::reason::Reason;
use crate::upstream::Upstream;
use crate::worker::{
    JobEventKind, JobReceiver, JobSender, JobUpdate, WorkerAgent, WorkerApi, WorkerId,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Notify};

/// The per-tenant scheduler driving expectations through their lifecycle
pub struct ExpectationManager<C: Clock> {
    pub(crate) id: ManagerId,
    pub(crate) cfg: ManagerConfig,
    pub(crate) clock: C,
    pub(crate) store: ExpectationStore,
    pub(crate) containers: ContainerStore,
    pub(crate) workers: HashMap<WorkerId, WorkerAgent>,
    pub(crate) publisher: StatusPublisher,
    pub(crate) upstream: Arc<dyn Upstream>,
    pub(crate) probe_defer: ProbeDefer,
    pub(crate) container_defer: ContainerDefer,

    job_tx: JobSender,
    job_rx: JobReceiver,
    wake: Arc<Notify>,
    /// A fulfillment this tick asked for dependents to re-run this tick
    pub(crate) trigger_again: bool,
}

impl<C: Clock> ExpectationManager<C> {
    pub fn new(id: ManagerId, cfg: ManagerConfig, upstream: Arc<dyn Upstream>, clock: C) -> Self {
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let publisher = StatusPublisher::new(
            cfg.publish_window,
            cfg.publish_retry_base,
            cfg.publish_retry_max,
        );
        Self {
            id,
            cfg,
            clock,
            store: ExpectationStore::new(),
            containers: ContainerStore::new(),
            workers: HashMap::new(),
            publisher,
            upstream,
            probe_defer: ProbeDefer::new(),
            container_defer: ContainerDefer::new(),
            job_tx,
            job_rx,
            wake: Arc::new(Notify::new()),
            trigger_again: false,
        }
    }

    pub fn manager_id(&self) -> &ManagerId {
        &self.id
    }

    /// Channel end a worker uses to stream job events to this manager
    pub fn job_update_sender(&self) -> JobSender {
        self.job_tx.clone()
    }

    /// Handle for waking the run loop out of its inter-tick sleep
    pub fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    // ==================== worker lifecycle ====================

    /// A worker dialed in (or re-dialed after a disconnect)
    pub fn connect_worker(&mut self, api: Arc<dyn WorkerApi>) {
        let now = self.clock.now();
        let worker_id = api.id();
        match self.workers.get_mut(&worker_id) {
            Some(agent) => {
                agent.api = api;
                agent.capabilities = agent.api.capabilities();
                agent.note_seen(now);
            }
            None => {
                self.workers
                    .insert(worker_id.clone(), WorkerAgent::new(api, &self.clock));
            }
        }
        tracing::info!(manager = %self.id, worker = %worker_id, "worker connected");

        // New capacity or capabilities: stalled expectations should re-probe
        for tracked in self.store.iter_mut() {
            if matches!(
                tracked.state,
                ExpectationState::New | ExpectationState::Waiting
            ) {
                tracked.dirty = true;
            }
        }
        self.wake.notify_one();
    }

    pub fn disconnect_worker(&mut self, worker_id: &WorkerId) {
        self.handle_worker_disconnect(worker_id);
    }

    pub fn note_worker_heartbeat(&mut self, worker_id: &WorkerId) {
        let now = self.clock.now();
        if let Some(agent) = self.workers.get_mut(worker_id) {
            agent.note_seen(now);
        }
    }

    pub fn connected_worker_count(&self) -> usize {
        self.workers.values().filter(|agent| agent.connected).count()
    }

    pub fn worker_assignment_count(&self, worker_id: &WorkerId) -> usize {
        self.workers
            .get(worker_id)
            .map(|agent| agent.assignments.len())
            .unwrap_or(0)
    }

    // ==================== upstream-facing inputs ====================

    /// Replace the desired expectation set (expectations-in channel)
    pub fn ingest_expectations(&mut self, expectations: Vec<Expectation>) {
        let changes = self.store.ingest(expectations, &self.clock);
        for change in &changes {
            let id = match change {
                IngestChange::Inserted { id }
                | IngestChange::Restarted { id }
                | IngestChange::Removed { id } => id.clone(),
            };
            self.enqueue_status(&id);
        }
        if !changes.is_empty() {
            tracing::info!(
                manager = %self.id,
                changes = changes.len(),
                tracked = self.store.len(),
                "expectation set ingested"
            );
            self.wake.notify_one();
        }
    }

    /// Replace the configured package container set
    pub fn ingest_containers(&mut self, containers: Vec<PackageContainer>) {
        let changes = self.containers.ingest(containers);
        if changes > 0 {
            tracing::info!(manager = %self.id, changes, "package containers ingested");
            self.wake.notify_one();
        }
    }

    /// External abort: park the expectation until upstream removes or
    /// updates it
    pub fn abort_expectation(&mut self, id: &ExpectationId) -> bool {
        if self.store.get(id).is_none() {
            return false;
        }
        self.transition(
            id,
            ExpectationState::Aborted,
            Reason::user_only("Aborted by upstream"),
            false,
            false,
        );
        self.store.mark_dirty(id);
        self.wake.notify_one();
        true
    }

    // ==================== read access ====================

    pub fn expectation_state(&self, id: &ExpectationId) -> Option<ExpectationState> {
        self.store.get(id).map(|tracked| tracked.state)
    }

    pub fn tracked(&self, id: &ExpectationId) -> Option<&TrackedExpectation> {
        self.store.get(id)
    }

    pub fn tracked_count(&self) -> usize {
        self.store.len()
    }

    pub fn container(&self, id: &crate::package::ContainerId) -> Option<&super::TrackedPackageContainer> {
        self.containers.get(id)
    }

    // ==================== the loop ====================

    /// One evaluation tick: drain job events, check liveness, run container
    /// duties, advance every due expectation, flush statuses
    pub async fn tick(&mut self) {
        self.trigger_again = false;
        self.drain_job_updates();
        let now = self.clock.now();
        self.prune_stale_workers(now);
        self.evaluate_containers().await;

        for id in self.store.snapshot() {
            self.evaluate_one(&id).await;
        }
        if self.trigger_again {
            // A fulfillment asked for its dependents on this same tick
            for id in self.store.snapshot() {
                let dirty = self.store.get(&id).map(|t| t.dirty).unwrap_or(false);
                if dirty {
                    self.evaluate_one(&id).await;
                }
            }
        }

        self.flush_statuses().await;
    }

    /// Run forever: tick, then sleep until the interval elapses or
    /// something marks the table dirty
    pub async fn run(&mut self) {
        loop {
            self.tick().await;
            if self.store.any_dirty() {
                continue;
            }
            let wake = Arc::clone(&self.wake);
            tokio::select! {
                _ = wake.notified() => {}
                _ = tokio::time::sleep(self.cfg.evaluation_interval) => {}
            }
        }
    }

    async fn evaluate_one(&mut self, id: &ExpectationId) {
        let now = self.clock.now();
        let state = {
            let Some(tracked) = self.store.get_mut(id) else {
                return;
            };
            if !tracked.ready_for_evaluation(now) {
                return;
            }
            tracked.begin_evaluation(now, self.cfg.probe_requery_interval);
            tracked.state
        };

        let result = match state {
            ExpectationState::New => self.eval_new(id).await,
            ExpectationState::Waiting => self.eval_waiting(id).await,
            ExpectationState::Ready => self.eval_ready(id).await,
            ExpectationState::Working => self.eval_working(id).await,
            ExpectationState::Fulfilled => self.eval_fulfilled(id).await,
            ExpectationState::Removed => self.eval_removed(id).await,
            ExpectationState::Restarted => self.eval_restarted(id).await,
            ExpectationState::Aborted => self.eval_aborted(id).await,
        };

        match result {
            Ok(outcome) => self.apply_outcome(id, state, outcome),
            Err(err) => self.apply_eval_error(id, err),
        }
    }

    // ==================== outcome interpretation ====================

    fn apply_outcome(&mut self, id: &ExpectationId, from: ExpectationState, outcome: EvalOutcome) {
        if outcome.remove_record {
            if let Some(tracked) = self.store.get_mut(id) {
                tracked.reason = outcome
                    .reason
                    .unwrap_or_else(|| Reason::user_only("Expectation removed"));
                tracked.is_error = false;
            }
            self.enqueue_status(id);
            self.release_assignment(id);
            self.store.remove(id);
            tracing::info!(expectation = %id, "tracked expectation dropped");
            return;
        }

        match outcome.next_state {
            Some(to) if to != from => {
                self.transition(
                    id,
                    to,
                    outcome.reason.unwrap_or_default(),
                    outcome.counts_as_error,
                    outcome.counts_as_error,
                );
            }
            _ => {
                // Remain in place; surface a changed reason, count a retry
                let now = self.clock.now();
                let mut reason_changed = false;
                if let Some(tracked) = self.store.get_mut(id) {
                    if let Some(reason) = outcome.reason {
                        if tracked.reason != reason {
                            tracked.reason = reason.clone();
                            reason_changed = true;
                        }
                        if outcome.counts_as_error {
                            tracked.record_error(reason, &self.cfg, now);
                        }
                    } else if outcome.counts_as_error {
                        let reason = tracked.reason.clone();
                        tracked.record_error(reason, &self.cfg, now);
                    }
                }
                if reason_changed {
                    self.enqueue_status(id);
                }
            }
        }
    }

    /// The reset-to-NEW safety net: no error escapes the loop
    fn apply_eval_error(&mut self, id: &ExpectationId, err: EvalError) {
        let reason = err.to_reason();
        match err {
            EvalError::Transport { worker, .. } => {
                tracing::warn!(expectation = %id, worker = %worker, "transport failure during evaluation");
                // Quarantine the worker; this also reverts WORKING items
                self.handle_worker_disconnect(&worker);
                match self.expectation_state(id) {
                    Some(state) if state.is_side_state() => {
                        self.stay_with_error(id, reason, false);
                    }
                    Some(state) if state != ExpectationState::New => {
                        // Not the expectation's fault: no error count
                        self.transition(id, ExpectationState::New, reason, false, false);
                    }
                    _ => {
                        self.stay_with_error(id, reason, false);
                    }
                }
            }
            EvalError::WorkerReported { worker, .. } => {
                tracing::info!(expectation = %id, worker = %worker, reason = %reason, "worker reported failure");
                match self.expectation_state(id) {
                    Some(state) if state.is_side_state() => {
                        self.stay_with_error(id, reason, true);
                    }
                    _ => {
                        self.transition(id, ExpectationState::New, reason, true, true);
                    }
                }
            }
            EvalError::Config(_) => {
                tracing::warn!(expectation = %id, reason = %reason.tech, "invalid expectation");
                self.transition(id, ExpectationState::Aborted, reason, true, false);
            }
            EvalError::Internal(ref context) => {
                tracing::error!(expectation = %id, context = %context, "internal error during evaluation");
                match self.expectation_state(id) {
                    Some(state) if state.is_side_state() => {
                        self.stay_with_error(id, reason, true);
                    }
                    Some(_) => {
                        self.transition(id, ExpectationState::New, reason, true, true);
                    }
                    None => {}
                }
            }
        }
    }

    fn stay_with_error(&mut self, id: &ExpectationId, reason: Reason, count: bool) {
        let now = self.clock.now();
        if let Some(tracked) = self.store.get_mut(id) {
            tracked.reason = reason.clone();
            tracked.is_error = true;
            if count {
                tracked.record_error(reason, &self.cfg, now);
            }
        }
        self.enqueue_status(id);
    }

    /// Apply a state change: bookkeeping, status record, dependent fan-out
    pub(crate) fn transition(
        &mut self,
        id: &ExpectationId,
        to: ExpectationState,
        reason: Reason,
        is_error: bool,
        counts_as_error: bool,
    ) {
        let now = self.clock.now();
        let (from, same_tick) = {
            let Some(tracked) = self.store.get_mut(id) else {
                return;
            };
            let from = tracked.state;
            tracked.state = to;
            tracked.reason = reason.clone();
            tracked.is_error = is_error;

            // Forward progress wipes the error slate
            if let (Some(a), Some(b)) = (from.pipeline_rank(), to.pipeline_rank()) {
                if b > a {
                    tracked.reset_errors();
                }
            }
            if counts_as_error {
                tracked.record_error(reason.clone(), &self.cfg, now);
            }

            match to {
                ExpectationState::Fulfilled => {
                    tracked.next_evaluation = Some(now + self.cfg.reverify_interval);
                    tracked.status.work_progress = None;
                }
                ExpectationState::New => {
                    tracked.status.work_progress = None;
                }
                _ => {}
            }

            (from, tracked.session.trigger_other_expectations_again)
        };

        // Leaving the assigned stretch of the pipeline frees the slot; side
        // states keep it so their cancel can still reach the worker
        if matches!(to, ExpectationState::New | ExpectationState::Fulfilled) {
            self.release_assignment(id);
        }

        tracing::info!(
            manager = %self.id,
            expectation = %id,
            from = %from,
            to = %to,
            reason = %reason,
            "expectation transition"
        );
        self.enqueue_status(id);

        if to == ExpectationState::Fulfilled {
            self.wake_dependents(id, same_tick);
        }
    }

    fn wake_dependents(&mut self, id: &ExpectationId, same_tick: bool) {
        let dependents = self.store.dependents_of(id);
        for dependent in &dependents {
            self.store.mark_dirty(dependent);
            // A fulfilled dependency overrides any pending backoff
            if let Some(tracked) = self.store.get_mut(dependent) {
                tracked.next_evaluation = None;
            }
        }
        if !dependents.is_empty() {
            if same_tick {
                self.trigger_again = true;
            }
            self.wake.notify_one();
        }
    }

    // ==================== job events ====================

    fn drain_job_updates(&mut self) {
        while let Ok(update) = self.job_rx.try_recv() {
            self.apply_job_update(update);
        }
    }

    fn apply_job_update(&mut self, update: JobUpdate) {
        let now = self.clock.now();
        self.note_worker_seen(&update.worker);

        // Completions may arrive in any order; match on the work id
        let found = self
            .store
            .iter()
            .find(|tracked| tracked.work_in_progress.as_ref() == Some(&update.wip))
            .map(|tracked| tracked.id().clone());
        let Some(id) = found else {
            tracing::debug!(wip = %update.wip, worker = %update.worker, "job event for unknown work");
            return;
        };

        match update.event {
            JobEventKind::Progress { fraction } => {
                if let Some(tracked) = self.store.get_mut(&id) {
                    tracked.status.work_progress = Some(fraction);
                    tracked.last_job_update = Some(now);
                }
                self.enqueue_status(&id);
            }
            JobEventKind::Done {
                actual_version_hash,
            } => {
                let expected = self
                    .store
                    .get(&id)
                    .map(|tracked| tracked.exp.content_version_hash.clone())
                    .unwrap_or_default();
                if actual_version_hash != expected {
                    self.transition(
                        &id,
                        ExpectationState::New,
                        Reason::new(
                            "Work produced the wrong package version",
                            format!(
                                "worker {} reported version hash {actual_version_hash}, expected {expected}",
                                update.worker
                            ),
                        ),
                        true,
                        true,
                    );
                    return;
                }
                if let Some(tracked) = self.store.get_mut(&id) {
                    tracked.status.actual_version_hash = Some(actual_version_hash);
                    tracked.status.target_exists = Some(true);
                    tracked.status.work_progress = None;
                    tracked.fulfilled_by = Some(update.worker.clone());
                    tracked.session.trigger_other_expectations_again = true;
                }
                self.transition(
                    &id,
                    ExpectationState::Fulfilled,
                    Reason::user_only("Work completed"),
                    false,
                    false,
                );
            }
            JobEventKind::Error { reason } => {
                self.transition(&id, ExpectationState::New, reason, true, true);
            }
        }
    }

    // ==================== worker liveness ====================

    fn prune_stale_workers(&mut self, now: Instant) {
        let stale: Vec<WorkerId> = self
            .workers
            .values()
            .filter(|agent| agent.connected && agent.is_stale(now, self.cfg.worker_heartbeat_timeout))
            .map(|agent| agent.id.clone())
            .collect();
        for worker_id in stale {
            tracing::warn!(worker = %worker_id, "worker heartbeat lapsed");
            self.handle_worker_disconnect(&worker_id);
        }
    }

    /// Quarantine a worker and revert everything it was carrying
    pub(crate) fn handle_worker_disconnect(&mut self, worker_id: &WorkerId) {
        let was_connected = match self.workers.get_mut(worker_id) {
            Some(agent) => {
                let was = agent.connected;
                agent.connected = false;
                agent.assignments.clear();
                was
            }
            None => return,
        };
        if was_connected {
            tracing::warn!(manager = %self.id, worker = %worker_id, "worker disconnected");
        }

        let mut reverts = Vec::new();
        for tracked in self.store.iter_mut() {
            tracked.forget_worker(worker_id);
            if tracked.fulfilled_by.as_ref() == Some(worker_id) {
                tracked.fulfilled_by = None;
            }
            if tracked.assigned_worker.as_ref() == Some(worker_id) {
                let revert = matches!(
                    tracked.state,
                    ExpectationState::Waiting
                        | ExpectationState::Ready
                        | ExpectationState::Working
                );
                tracked.clear_work();
                if revert {
                    reverts.push(tracked.id().clone());
                }
            }
        }
        for id in reverts {
            // The worker vanished; not the expectation's fault
            self.transition(
                &id,
                ExpectationState::New,
                Reason::new(
                    "Worker disconnected",
                    format!("assigned worker {worker_id} disconnected"),
                ),
                false,
                false,
            );
        }
    }

    // ==================== status publication ====================

    pub(crate) fn enqueue_status(&mut self, id: &ExpectationId) {
        let Some(tracked) = self.store.get(id) else {
            return;
        };
        let record = StatusRecord {
            id: id.clone(),
            state: tracked.state,
            reason: tracked.reason.clone(),
            is_error: tracked.is_error,
            status_info: (tracked.error_count > 0)
                .then(|| format!("errors: {}", tracked.error_count)),
            progress: tracked.status.work_progress,
            actual_version_hash: tracked.status.actual_version_hash.clone(),
            timestamp: self.clock.now_utc(),
        };
        let now = self.clock.now();
        self.publisher.enqueue(record, now);
    }

    async fn flush_statuses(&mut self) {
        let now = self.clock.now();
        if self.publisher.due(now) {
            let upstream = Arc::clone(&self.upstream);
            self.publisher.flush(upstream.as_ref(), now).await;
        }
    }

    // ==================== consistency checks ====================

    /// Cross-check the table against the rules the loop must uphold.
    /// Used by tests after every step; returns the first violation found.
    pub fn verify_invariants(&self) -> Result<(), String> {
        for tracked in self.store.iter() {
            let id = tracked.id();

            if tracked.state == ExpectationState::Working {
                let Some(worker_id) = &tracked.assigned_worker else {
                    return Err(format!("{id} is WORKING without an assigned worker"));
                };
                if tracked.work_in_progress.is_none() {
                    return Err(format!("{id} is WORKING without a work id"));
                }
                let Some(agent) = self.workers.get(worker_id) else {
                    return Err(format!("{id} is assigned to unknown worker {worker_id}"));
                };
                if !agent.assignments.contains(id) {
                    return Err(format!(
                        "{id} is WORKING on {worker_id} but the worker does not hold it"
                    ));
                }
            }

            if tracked.state == ExpectationState::Fulfilled
                && tracked.status.actual_version_hash.as_deref()
                    != Some(tracked.exp.content_version_hash.as_str())
            {
                return Err(format!(
                    "{id} is FULFILLED with version hash {:?}, expected {}",
                    tracked.status.actual_version_hash, tracked.exp.content_version_hash
                ));
            }

            if matches!(
                tracked.state,
                ExpectationState::Waiting | ExpectationState::Ready | ExpectationState::Working
            ) {
                if let Some(dep) = self.store.first_unmet_dependency(&tracked.exp) {
                    return Err(format!(
                        "{id} is {} with unmet dependency {dep}",
                        tracked.state
                    ));
                }
            }
        }

        for agent in self.workers.values() {
            if agent.assignments.len() > agent.capabilities.concurrency_limit {
                return Err(format!(
                    "worker {} holds {} assignments over its limit {}",
                    agent.id,
                    agent.assignments.len(),
                    agent.capabilities.concurrency_limit
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
#[path = "runtime_tests.rs"]
mod tests;
