// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! One evaluation step per lifecycle state
//!
//! Each handler observes worker replies and returns an [`EvalOutcome`]
//! naming the next state, instead of mutating state mid-flight or throwing.
//! The loop boundary in `runtime.rs` interprets outcomes and errors; the
//! reset-to-NEW safety net lives there, not here.

use super::runtime::ExpectationManager;
use super::selection;
use super::tracked::ExpectationState;
use crate::clock::Clock;
use crate::error::EvalError;
use crate::package::ExpectationId;
use crate::reason::Reason;
use crate::worker::{call_with_timeout, WorkerError, WorkerId};
use std::sync::Arc;

/// What an evaluation step decided
#[derive(Debug, Clone)]
pub(crate) struct EvalOutcome {
    /// Next state; `None` means remain in the current state
    pub next_state: Option<ExpectationState>,
    /// Reason update, also applied when remaining
    pub reason: Option<Reason>,
    /// Charge this against the expectation's error count and back off
    pub counts_as_error: bool,
    /// Drop the tracked record entirely (end of REMOVED processing)
    pub remove_record: bool,
}

impl EvalOutcome {
    pub fn stay() -> Self {
        Self {
            next_state: None,
            reason: None,
            counts_as_error: false,
            remove_record: false,
        }
    }

    pub fn stay_with(reason: Reason) -> Self {
        Self {
            reason: Some(reason),
            ..Self::stay()
        }
    }

    pub fn goto(state: ExpectationState, reason: Reason) -> Self {
        Self {
            next_state: Some(state),
            reason: Some(reason),
            ..Self::stay()
        }
    }

    /// Back to NEW, counted against the expectation
    pub fn error_to_new(reason: Reason) -> Self {
        Self {
            counts_as_error: true,
            ..Self::goto(ExpectationState::New, reason)
        }
    }

    /// Remain in place, counted, retried after backoff
    pub fn retry(reason: Reason) -> Self {
        Self {
            counts_as_error: true,
            ..Self::stay_with(reason)
        }
    }

    pub fn remove(reason: Reason) -> Self {
        Self {
            remove_record: true,
            reason: Some(reason),
            ..Self::stay()
        }
    }
}

/// Classify a failed worker call for the loop boundary
fn worker_eval_error(worker: WorkerId, err: WorkerError) -> EvalError {
    if err.is_transport() {
        EvalError::Transport {
            worker,
            source: err,
        }
    } else {
        EvalError::WorkerReported {
            reason: Reason::new("Worker declined", err.to_string()),
            worker,
        }
    }
}

impl<C: Clock> ExpectationManager<C> {
    /// NEW: validate, wait for dependencies, find worker support
    pub(crate) async fn eval_new(&mut self, id: &ExpectationId) -> Result<EvalOutcome, EvalError> {
        let exp = self.expectation_arc(id)?;

        if let Err(problem) = exp.validate() {
            return Err(EvalError::Config(problem.to_string()));
        }

        if let Some(dep) = self.store.first_unmet_dependency(&exp) {
            let dep = dep.clone();
            return Ok(EvalOutcome::stay_with(Reason::new(
                format!("Waiting for {dep}"),
                format!("dependency {dep} is not fulfilled"),
            )));
        }

        let now = self.clock.now();
        let report = {
            let Some(tracked) = self.store.get_mut(id) else {
                return Err(EvalError::Internal(format!("expectation {id} vanished")));
            };
            selection::probe_for_support(
                &mut self.workers,
                tracked,
                &self.probe_defer,
                &self.cfg,
                now,
            )
            .await
        };
        for worker in &report.disconnected {
            self.handle_worker_disconnect(worker);
        }

        if report.found_available {
            Ok(EvalOutcome::goto(
                ExpectationState::Waiting,
                Reason::user_only("Found a worker that can handle the expectation"),
            ))
        } else {
            if let Some(tracked) = self.store.get_mut(id) {
                tracked.no_worker_reason = Some(report.no_worker_reason.clone());
            }
            Ok(EvalOutcome::stay_with(report.no_worker_reason))
        }
    }

    /// WAITING: assign a worker, check fulfillment, check readiness
    pub(crate) async fn eval_waiting(
        &mut self,
        id: &ExpectationId,
    ) -> Result<EvalOutcome, EvalError> {
        let exp = self.expectation_arc(id)?;

        // A dependency may have come undone since we left NEW
        if let Some(dep) = self.store.first_unmet_dependency(&exp) {
            let dep = dep.clone();
            return Ok(EvalOutcome::goto(
                ExpectationState::New,
                Reason::new(
                    format!("Waiting for {dep}"),
                    format!("dependency {dep} is no longer fulfilled"),
                ),
            ));
        }

        let now = self.clock.now();
        let pick = {
            let Some(tracked) = self.store.get_mut(id) else {
                return Err(EvalError::Internal(format!("expectation {id} vanished")));
            };
            selection::pick_assignable(
                &mut self.workers,
                tracked,
                &self.probe_defer,
                &self.cfg,
                now,
            )
            .await
        };
        for worker in &pick.disconnected {
            self.handle_worker_disconnect(worker);
        }

        let Some(worker_id) = pick.worker else {
            return Ok(EvalOutcome::stay_with(pick.no_worker_reason.unwrap_or_else(
                || Reason::user_only("No available worker"),
            )));
        };

        self.take_assignment(id, &worker_id);
        let api = self.worker_api(&worker_id)?;

        let fulfilled = call_with_timeout(self.cfg.call_timeout, api.is_fulfilled(&exp, false))
            .await
            .map_err(|err| worker_eval_error(worker_id.clone(), err))?;
        self.note_worker_seen(&worker_id);

        if fulfilled.fulfilled {
            let actual = fulfilled
                .actual_version_hash
                .clone()
                .unwrap_or_else(|| exp.content_version_hash.clone());
            if actual != exp.content_version_hash {
                self.release_assignment(id);
                return Ok(EvalOutcome::error_to_new(Reason::new(
                    "Package exists but has the wrong version",
                    format!(
                        "actual version hash {actual} does not match expected {}",
                        exp.content_version_hash
                    ),
                )));
            }
            if let Some(tracked) = self.store.get_mut(id) {
                tracked.status.actual_version_hash = Some(actual);
                tracked.status.target_exists = Some(true);
                tracked.session.trigger_other_expectations_again = true;
                tracked.fulfilled_by = Some(worker_id.clone());
            }
            return Ok(EvalOutcome::goto(
                ExpectationState::Fulfilled,
                Reason::user_only("Already fulfilled"),
            ));
        }

        let ready = call_with_timeout(self.cfg.call_timeout, api.is_ready_to_start(&exp))
            .await
            .map_err(|err| worker_eval_error(worker_id.clone(), err))?;
        if let Some(tracked) = self.store.get_mut(id) {
            tracked.status.source_exists = ready.source_exists;
        }

        if ready.ready {
            return Ok(EvalOutcome::goto(
                ExpectationState::Ready,
                Reason::user_only("Ready to start work"),
            ));
        }

        // Not starting now: free the slot for someone else
        self.release_assignment(id);

        if ready.is_waiting_for_another {
            Ok(EvalOutcome::stay_with(ready.reason))
        } else {
            // Source missing or similar; forget availability and re-probe
            if let Some(tracked) = self.store.get_mut(id) {
                tracked.available_workers.clear();
                tracked.worker_costs.clear();
            }
            Ok(EvalOutcome::goto(ExpectationState::New, ready.reason))
        }
    }

    /// READY: hand the work to the assigned worker
    pub(crate) async fn eval_ready(
        &mut self,
        id: &ExpectationId,
    ) -> Result<EvalOutcome, EvalError> {
        let exp = self.expectation_arc(id)?;

        let assigned = self.store.get(id).and_then(|t| t.assigned_worker.clone());
        let Some(worker_id) = assigned else {
            return Ok(EvalOutcome::goto(
                ExpectationState::New,
                Reason::user_only("Lost the assigned worker"),
            ));
        };
        if !self.worker_connected(&worker_id) {
            return Ok(EvalOutcome::goto(
                ExpectationState::New,
                Reason::user_only("Assigned worker disconnected"),
            ));
        }

        let api = self.worker_api(&worker_id)?;
        match call_with_timeout(
            self.cfg.call_timeout,
            api.work_on(&exp, &exp.work_options),
        )
        .await
        {
            Ok(wip) => {
                let now = self.clock.now();
                self.note_worker_seen(&worker_id);
                if let Some(tracked) = self.store.get_mut(id) {
                    tracked.work_in_progress = Some(wip);
                    tracked.last_job_update = Some(now);
                    tracked.status.work_progress = Some(0.0);
                }
                Ok(EvalOutcome::goto(
                    ExpectationState::Working,
                    Reason::user_only("Work started"),
                ))
            }
            Err(WorkerError::Rejected(message)) => Ok(EvalOutcome::goto(
                ExpectationState::New,
                Reason::new("Worker declined the work", message),
            )),
            Err(err) => Err(EvalError::Transport {
                worker: worker_id,
                source: err,
            }),
        }
    }

    /// WORKING: watch for lost workers and silent jobs; job events arrive
    /// over the update channel, not here
    pub(crate) async fn eval_working(
        &mut self,
        id: &ExpectationId,
    ) -> Result<EvalOutcome, EvalError> {
        let now = self.clock.now();
        let (worker_id, last_update) = {
            let Some(tracked) = self.store.get(id) else {
                return Err(EvalError::Internal(format!("expectation {id} vanished")));
            };
            (
                tracked.assigned_worker.clone(),
                tracked.last_job_update.unwrap_or(now),
            )
        };

        let Some(worker_id) = worker_id else {
            return Ok(EvalOutcome::goto(
                ExpectationState::New,
                Reason::user_only("Lost the assigned worker"),
            ));
        };
        if !self.worker_connected(&worker_id) {
            return Ok(EvalOutcome::goto(
                ExpectationState::New,
                Reason::user_only("Worker disconnected during work"),
            ));
        }

        if now.duration_since(last_update) > self.cfg.work_update_timeout {
            self.cancel_running_work(id).await;
            return Ok(EvalOutcome::goto(
                ExpectationState::New,
                Reason::new(
                    "Work lost contact",
                    format!(
                        "no job events for more than {:?} from worker {worker_id}",
                        self.cfg.work_update_timeout
                    ),
                ),
            ));
        }

        Ok(EvalOutcome::stay())
    }

    /// FULFILLED: periodic re-verification, preferring the fulfilling worker
    pub(crate) async fn eval_fulfilled(
        &mut self,
        id: &ExpectationId,
    ) -> Result<EvalOutcome, EvalError> {
        let exp = self.expectation_arc(id)?;
        let now = self.clock.now();

        let mut verifier = {
            let Some(tracked) = self.store.get(id) else {
                return Err(EvalError::Internal(format!("expectation {id} vanished")));
            };
            tracked
                .fulfilled_by
                .clone()
                .filter(|worker| self.worker_connected(worker))
                .or_else(|| self.cached_connected_worker(tracked))
        };

        if verifier.is_none() {
            // Nobody remembered; probe for someone who can answer
            let report = {
                let Some(tracked) = self.store.get_mut(id) else {
                    return Err(EvalError::Internal(format!("expectation {id} vanished")));
                };
                selection::probe_for_support(
                    &mut self.workers,
                    tracked,
                    &self.probe_defer,
                    &self.cfg,
                    now,
                )
                .await
            };
            for worker in &report.disconnected {
                self.handle_worker_disconnect(worker);
            }
            verifier = self
                .store
                .get(id)
                .and_then(|tracked| self.cached_connected_worker(tracked));
        }

        let Some(worker_id) = verifier else {
            if let Some(tracked) = self.store.get_mut(id) {
                tracked.next_evaluation = Some(now + self.cfg.reverify_interval);
            }
            return Ok(EvalOutcome::stay_with(Reason::user_only(
                "No worker available to re-verify",
            )));
        };

        let api = self.worker_api(&worker_id)?;
        let reply = call_with_timeout(self.cfg.call_timeout, api.is_fulfilled(&exp, true))
            .await
            .map_err(|err| worker_eval_error(worker_id.clone(), err))?;
        self.note_worker_seen(&worker_id);

        if reply.fulfilled {
            let actual = reply
                .actual_version_hash
                .clone()
                .unwrap_or_else(|| exp.content_version_hash.clone());
            if actual != exp.content_version_hash {
                if let Some(tracked) = self.store.get_mut(id) {
                    tracked.status.actual_version_hash = None;
                    tracked.fulfilled_by = None;
                }
                return Ok(EvalOutcome::goto(
                    ExpectationState::New,
                    Reason::new(
                        "Package version changed on target",
                        format!(
                            "re-verify saw version hash {actual}, expected {}",
                            exp.content_version_hash
                        ),
                    ),
                ));
            }
            if let Some(tracked) = self.store.get_mut(id) {
                tracked.status.actual_version_hash = Some(actual);
                tracked.fulfilled_by = Some(worker_id);
                tracked.next_evaluation = Some(now + self.cfg.reverify_interval);
            }
            Ok(EvalOutcome::stay())
        } else {
            if let Some(tracked) = self.store.get_mut(id) {
                tracked.status.actual_version_hash = None;
                tracked.fulfilled_by = None;
            }
            Ok(EvalOutcome::goto(ExpectationState::New, reply.reason))
        }
    }

    /// REMOVED: best-effort removal work, then drop the record
    pub(crate) async fn eval_removed(
        &mut self,
        id: &ExpectationId,
    ) -> Result<EvalOutcome, EvalError> {
        let exp = self.expectation_arc(id)?;
        self.cancel_running_work(id).await;

        let candidate = {
            let Some(tracked) = self.store.get(id) else {
                return Err(EvalError::Internal(format!("expectation {id} vanished")));
            };
            tracked
                .fulfilled_by
                .clone()
                .filter(|worker| self.worker_connected(worker))
                .or_else(|| self.cached_connected_worker(tracked))
        };

        let Some(worker_id) = candidate else {
            // No worker ever touched it, or none is left; nothing to undo
            return Ok(EvalOutcome::remove(Reason::user_only("Expectation removed")));
        };

        let api = self.worker_api(&worker_id)?;
        let reply = call_with_timeout(self.cfg.call_timeout, api.remove_expectation(&exp))
            .await
            .map_err(|err| worker_eval_error(worker_id.clone(), err))?;
        self.note_worker_seen(&worker_id);

        if reply.removed {
            if let Some(tracked) = self.store.get_mut(id) {
                tracked.session.expectation_can_be_removed = true;
            }
            Ok(EvalOutcome::remove(Reason::user_only("Expectation removed")))
        } else {
            Ok(EvalOutcome::retry(reply.reason.unwrap_or_else(|| {
                Reason::user_only("Removal not finished yet")
            })))
        }
    }

    /// RESTARTED: abort running work, clear runtime state, start over
    pub(crate) async fn eval_restarted(
        &mut self,
        id: &ExpectationId,
    ) -> Result<EvalOutcome, EvalError> {
        self.cancel_running_work(id).await;

        if let Some(tracked) = self.store.get_mut(id) {
            tracked.status = Default::default();
            tracked.fulfilled_by = None;
            tracked.available_workers.clear();
            tracked.unavailable_workers.clear();
            tracked.queried_workers.clear();
            tracked.worker_costs.clear();
            tracked.no_worker_reason = None;
            tracked.reset_errors();
        }

        Ok(EvalOutcome::goto(
            ExpectationState::New,
            Reason::user_only("Restarted after definition change"),
        ))
    }

    /// ABORTED: cancel anything still running, then park
    pub(crate) async fn eval_aborted(
        &mut self,
        id: &ExpectationId,
    ) -> Result<EvalOutcome, EvalError> {
        self.cancel_running_work(id).await;
        Ok(EvalOutcome::stay())
    }

    // ==================== shared helpers ====================

    fn expectation_arc(
        &self,
        id: &ExpectationId,
    ) -> Result<Arc<crate::package::Expectation>, EvalError> {
        self.store
            .get(id)
            .map(|tracked| Arc::clone(&tracked.exp))
            .ok_or_else(|| EvalError::Internal(format!("unknown expectation {id}")))
    }

    fn worker_api(
        &self,
        worker_id: &WorkerId,
    ) -> Result<Arc<dyn crate::worker::WorkerApi>, EvalError> {
        self.workers
            .get(worker_id)
            .map(|agent| Arc::clone(&agent.api))
            .ok_or_else(|| EvalError::Internal(format!("unknown worker {worker_id}")))
    }

    pub(crate) fn worker_connected(&self, worker_id: &WorkerId) -> bool {
        self.workers
            .get(worker_id)
            .is_some_and(|agent| agent.connected)
    }

    /// Any remembered supporting worker that is still connected
    fn cached_connected_worker(
        &self,
        tracked: &super::tracked::TrackedExpectation,
    ) -> Option<WorkerId> {
        let mut ids: Vec<&WorkerId> = tracked
            .available_workers
            .keys()
            .filter(|worker| self.worker_connected(worker))
            .collect();
        ids.sort();
        ids.first().map(|worker| (*worker).clone())
    }

    pub(crate) fn note_worker_seen(&mut self, worker_id: &WorkerId) {
        let now = self.clock.now();
        if let Some(agent) = self.workers.get_mut(worker_id) {
            agent.note_seen(now);
        }
    }

    pub(crate) fn take_assignment(&mut self, id: &ExpectationId, worker_id: &WorkerId) {
        if let Some(tracked) = self.store.get_mut(id) {
            tracked.session.assigned_worker = Some(worker_id.clone());
            tracked.assigned_worker = Some(worker_id.clone());
        }
        if let Some(agent) = self.workers.get_mut(worker_id) {
            agent.assign(id.clone());
        }
    }

    pub(crate) fn release_assignment(&mut self, id: &ExpectationId) {
        let worker = self
            .store
            .get_mut(id)
            .map(|tracked| {
                let worker = tracked.assigned_worker.clone();
                tracked.clear_work();
                worker
            })
            .unwrap_or_default();
        if let Some(worker_id) = worker {
            if let Some(agent) = self.workers.get_mut(&worker_id) {
                agent.release(id);
            }
        }
    }

    /// Fire-and-forget cancel of any running work, then free the slot
    pub(crate) async fn cancel_running_work(&mut self, id: &ExpectationId) {
        let (wip, worker_id) = {
            let Some(tracked) = self.store.get(id) else {
                return;
            };
            (
                tracked.work_in_progress.clone(),
                tracked.assigned_worker.clone(),
            )
        };

        if let (Some(wip), Some(worker_id)) = (wip, worker_id) {
            if let Some(agent) = self.workers.get(&worker_id) {
                let api = Arc::clone(&agent.api);
                if let Err(err) =
                    call_with_timeout(self.cfg.call_timeout, api.cancel_work(&wip)).await
                {
                    tracing::warn!(
                        expectation = %id,
                        worker = %worker_id,
                        error = %err,
                        "cancel failed, continuing anyway"
                    );
                }
            }
        }
        self.release_assignment(id);
    }
}
