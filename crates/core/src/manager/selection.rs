// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker selection: who should handle this expectation right now
//!
//! Fast path: a remembered supporting worker with free capacity. Slow path:
//! probe a bounded number of not-recently-asked workers, caching positive
//! answers longer than negative ones. Selection minimizes worker-reported
//! cost with a deterministic id tiebreak. Transport failures quarantine the
//! worker; the caller fans the disconnect out to the rest of the table.

use super::tracked::TrackedExpectation;
use crate::config::ManagerConfig;
use crate::defer::DeferGets;
use crate::package::ExpectationId;
use crate::reason::Reason;
use crate::worker::{call_with_timeout, SupportReply, WorkerAgent, WorkerError, WorkerId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Coalesces duplicate in-flight support probes per (worker, expectation)
pub(crate) type ProbeDefer = DeferGets<(WorkerId, ExpectationId), Result<SupportReply, WorkerError>>;

/// Outcome of a probe round
pub(crate) struct ProbeReport {
    /// A connected worker is remembered as supporting the expectation
    pub found_available: bool,
    /// Workers that failed at the transport level during the round
    pub disconnected: Vec<WorkerId>,
    /// Why no worker is available, when none is
    pub no_worker_reason: Reason,
}

/// Outcome of trying to pick an assignable worker
pub(crate) struct PickReport {
    pub worker: Option<WorkerId>,
    pub disconnected: Vec<WorkerId>,
    pub no_worker_reason: Option<Reason>,
}

/// Ask up to `probe_budget` unqueried workers whether they support the
/// expectation, remembering their answers with TTLs
pub(crate) async fn probe_for_support(
    workers: &mut HashMap<WorkerId, WorkerAgent>,
    tracked: &mut TrackedExpectation,
    defer: &ProbeDefer,
    cfg: &ManagerConfig,
    now: Instant,
) -> ProbeReport {
    let mut disconnected = Vec::new();
    let mut denials: Vec<String> = Vec::new();

    let mut candidates: Vec<WorkerId> = workers
        .values()
        .filter(|agent| agent.connected)
        .filter(|agent| !tracked.available_workers.contains_key(&agent.id))
        .filter(|agent| !tracked.unavailable_workers.contains_key(&agent.id))
        .filter(|agent| !tracked.recently_queried(&agent.id, now, cfg.probe_requery_interval))
        .map(|agent| agent.id.clone())
        .collect();
    candidates.sort();
    candidates.truncate(cfg.probe_budget);

    for worker_id in candidates {
        let Some(agent) = workers.get(&worker_id) else {
            continue;
        };
        let api = Arc::clone(&agent.api);
        let exp = Arc::clone(&tracked.exp);
        let timeout = cfg.call_timeout;
        tracked.note_queried(worker_id.clone(), now);

        let reply = defer
            .get_or_join((worker_id.clone(), tracked.id().clone()), || async move {
                call_with_timeout(timeout, api.supports_expectation(&exp)).await
            })
            .await;

        match reply {
            Ok(reply) if reply.support => {
                // Supporting worker: fetch its cost for the tiebreak
                let api = workers
                    .get(&worker_id)
                    .map(|agent| Arc::clone(&agent.api));
                let Some(api) = api else { continue };
                let exp = Arc::clone(&tracked.exp);
                match call_with_timeout(timeout, api.cost_for_expectation(&exp)).await {
                    Ok(cost) => {
                        if let Some(agent) = workers.get_mut(&worker_id) {
                            agent.note_seen(now);
                        }
                        tracked.remember_available(
                            worker_id,
                            now,
                            cfg.available_ttl,
                            cost.cost,
                        );
                    }
                    Err(err) => {
                        tracing::debug!(worker = %worker_id, error = %err, "cost query failed");
                        if let Some(agent) = workers.get_mut(&worker_id) {
                            agent.connected = false;
                        }
                        tracked.forget_worker(&worker_id);
                        disconnected.push(worker_id);
                    }
                }
            }
            Ok(reply) => {
                if let Some(agent) = workers.get_mut(&worker_id) {
                    agent.note_seen(now);
                }
                denials.push(format!("{worker_id}: {}", reply.reason.user));
                tracked.remember_unavailable(worker_id, now, cfg.unavailable_ttl);
            }
            Err(err) => {
                tracing::debug!(worker = %worker_id, error = %err, "support probe failed");
                if let Some(agent) = workers.get_mut(&worker_id) {
                    agent.connected = false;
                }
                tracked.forget_worker(&worker_id);
                denials.push(format!("{worker_id}: {err}"));
                disconnected.push(worker_id);
            }
        }
    }

    let found_available = tracked
        .available_workers
        .keys()
        .any(|id| workers.get(id).is_some_and(|agent| agent.connected));

    let no_worker_reason = if !workers.values().any(|agent| agent.connected) {
        Reason::user_only("No workers connected")
    } else {
        Reason::new("No worker supports this Expectation", denials.join("; "))
    };

    ProbeReport {
        found_available,
        disconnected,
        no_worker_reason,
    }
}

/// Least-cost remembered worker with free capacity; ties break on id
pub(crate) fn pick_idle(
    workers: &HashMap<WorkerId, WorkerAgent>,
    tracked: &TrackedExpectation,
) -> Option<WorkerId> {
    let mut best: Option<(f64, &WorkerId)> = None;
    for worker_id in tracked.available_workers.keys() {
        let Some(agent) = workers.get(worker_id) else {
            continue;
        };
        if !agent.has_capacity() {
            continue;
        }
        let cost = tracked
            .worker_costs
            .get(worker_id)
            .copied()
            .unwrap_or(f64::MAX);
        let better = match best {
            None => true,
            Some((best_cost, best_id)) => {
                cost < best_cost || (cost == best_cost && worker_id < best_id)
            }
        };
        if better {
            best = Some((cost, worker_id));
        }
    }
    best.map(|(_, worker_id)| worker_id.clone())
}

/// Find a worker to assign: fast path over remembered availability, then a
/// probe round if nothing idle is known
pub(crate) async fn pick_assignable(
    workers: &mut HashMap<WorkerId, WorkerAgent>,
    tracked: &mut TrackedExpectation,
    defer: &ProbeDefer,
    cfg: &ManagerConfig,
    now: Instant,
) -> PickReport {
    if let Some(worker) = pick_idle(workers, tracked) {
        return PickReport {
            worker: Some(worker),
            disconnected: Vec::new(),
            no_worker_reason: None,
        };
    }

    let report = probe_for_support(workers, tracked, defer, cfg, now).await;
    let worker = pick_idle(workers, tracked);
    let no_worker_reason = if worker.is_none() {
        Some(if report.found_available {
            Reason::user_only("Waiting for a worker to become free")
        } else {
            report.no_worker_reason
        })
    } else {
        None
    };

    PickReport {
        worker,
        disconnected: report.disconnected,
        no_worker_reason,
    }
}

#[cfg(test)]
#[path = "selection_tests.rs"]
mod tests;
