// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tracked package containers with server-side duties
//!
//! Some containers need periodic cleanup and monitoring that must run
//! somewhere; the manager delegates both to a worker that supports the
//! container and re-delegates when that worker goes away.

use super::runtime::ExpectationManager;
use super::status::ContainerStatusRecord;
use crate::clock::Clock;
use crate::defer::DeferGets;
use crate::package::{ContainerId, PackageContainer};
use crate::reason::Reason;
use crate::worker::{call_with_timeout, SupportReply, WorkerError, WorkerId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Coalesces duplicate in-flight container support queries
pub(crate) type ContainerDefer = DeferGets<(WorkerId, ContainerId), Result<SupportReply, WorkerError>>;

/// A package container plus its delegation state
#[derive(Debug, Clone)]
pub struct TrackedPackageContainer {
    pub container: PackageContainer,
    /// Worker currently responsible for cron and monitors
    pub assigned_worker: Option<WorkerId>,
    pub monitors_set_up: bool,
    pub last_cron_run: Option<Instant>,
    pub next_check: Option<Instant>,
    pub status_ok: Option<bool>,
    pub reason: Reason,
}

impl TrackedPackageContainer {
    fn new(container: PackageContainer) -> Self {
        Self {
            container,
            assigned_worker: None,
            monitors_set_up: false,
            last_cron_run: None,
            next_check: None,
            status_ok: None,
            reason: Reason::default(),
        }
    }
}

/// Table of tracked package containers keyed by id
#[derive(Default)]
pub struct ContainerStore {
    items: HashMap<ContainerId, TrackedPackageContainer>,
}

impl ContainerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the configured container set
    pub fn ingest(&mut self, containers: Vec<PackageContainer>) -> usize {
        let incoming: Vec<ContainerId> = containers.iter().map(|c| c.id.clone()).collect();
        let mut changes = 0;

        for container in containers {
            match self.items.get_mut(&container.id) {
                None => {
                    self.items
                        .insert(container.id.clone(), TrackedPackageContainer::new(container));
                    changes += 1;
                }
                Some(tracked) if tracked.container != container => {
                    // Changed definition: re-delegate from scratch
                    *tracked = TrackedPackageContainer::new(container);
                    changes += 1;
                }
                Some(_) => {}
            }
        }

        let before = self.items.len();
        self.items.retain(|id, _| incoming.contains(id));
        changes + (before - self.items.len())
    }

    pub fn get(&self, id: &ContainerId) -> Option<&TrackedPackageContainer> {
        self.items.get(id)
    }

    pub fn get_mut(&mut self, id: &ContainerId) -> Option<&mut TrackedPackageContainer> {
        self.items.get_mut(id)
    }

    pub fn ids(&self) -> Vec<ContainerId> {
        let mut ids: Vec<ContainerId> = self.items.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<C: Clock> ExpectationManager<C> {
    /// Run container duties for every container whose cadence is due
    pub(crate) async fn evaluate_containers(&mut self) {
        let now = self.clock.now();
        for id in self.containers.ids() {
            let due = self
                .containers
                .get(&id)
                .is_some_and(|c| c.next_check.map_or(true, |t| t <= now));
            if due {
                self.evaluate_container(&id).await;
            }
        }
    }

    async fn evaluate_container(&mut self, id: &ContainerId) {
        let now = self.clock.now();
        let Some(tracked) = self.containers.get(id) else {
            return;
        };
        let container = tracked.container.clone();
        let before = (tracked.status_ok, tracked.reason.clone());

        let assigned = tracked
            .assigned_worker
            .clone()
            .filter(|worker| self.worker_connected(worker));
        let worker_id = match assigned {
            Some(worker) => Some(worker),
            None => self.find_container_worker(&container).await,
        };

        let Some(worker_id) = worker_id else {
            if let Some(tracked) = self.containers.get_mut(id) {
                tracked.assigned_worker = None;
                tracked.monitors_set_up = false;
                tracked.status_ok = Some(false);
                tracked.reason =
                    Reason::user_only("No worker available to handle the container");
                tracked.next_check = Some(now + self.cfg.container_cron_interval);
            }
            self.publish_container_status_if_changed(id, before);
            return;
        };

        if let Some(tracked) = self.containers.get_mut(id) {
            tracked.assigned_worker = Some(worker_id.clone());
        }

        // Monitors first, so a fresh delegation starts watching immediately
        let needs_monitors = self
            .containers
            .get(id)
            .is_some_and(|tracked| !tracked.monitors_set_up);
        if needs_monitors {
            let api = match self.workers.get(&worker_id) {
                Some(agent) => Arc::clone(&agent.api),
                None => return,
            };
            match call_with_timeout(
                self.cfg.call_timeout,
                api.setup_container_monitors(&container),
            )
            .await
            {
                Ok(reply) if reply.ok => {
                    self.note_worker_seen(&worker_id);
                    if let Some(tracked) = self.containers.get_mut(id) {
                        tracked.monitors_set_up = true;
                    }
                }
                Ok(reply) => {
                    if let Some(tracked) = self.containers.get_mut(id) {
                        tracked.status_ok = Some(false);
                        tracked.reason = reply
                            .reason
                            .unwrap_or_else(|| Reason::user_only("Monitor setup failed"));
                        tracked.next_check = Some(now + self.cfg.container_cron_interval);
                    }
                    self.publish_container_status_if_changed(id, before);
                    return;
                }
                Err(err) => {
                    self.container_worker_failed(id, &worker_id, err, before);
                    return;
                }
            }
        }

        let api = match self.workers.get(&worker_id) {
            Some(agent) => Arc::clone(&agent.api),
            None => return,
        };
        match call_with_timeout(self.cfg.call_timeout, api.run_container_cron(&container)).await {
            Ok(reply) => {
                self.note_worker_seen(&worker_id);
                if let Some(tracked) = self.containers.get_mut(id) {
                    tracked.last_cron_run = Some(now);
                    tracked.status_ok = Some(reply.ok);
                    tracked.reason = reply.reason.unwrap_or_default();
                    tracked.next_check = Some(now + self.cfg.container_cron_interval);
                }
                self.publish_container_status_if_changed(id, before);
            }
            Err(err) => {
                self.container_worker_failed(id, &worker_id, err, before);
            }
        }
    }

    /// Ask connected workers, in id order, who can take the container
    async fn find_container_worker(&mut self, container: &PackageContainer) -> Option<WorkerId> {
        let mut candidates: Vec<WorkerId> = self
            .workers
            .values()
            .filter(|agent| agent.connected)
            .map(|agent| agent.id.clone())
            .collect();
        candidates.sort();

        let mut lost = Vec::new();
        let mut found = None;
        for worker_id in candidates {
            let Some(agent) = self.workers.get(&worker_id) else {
                continue;
            };
            let api = Arc::clone(&agent.api);
            let container = container.clone();
            let timeout = self.cfg.call_timeout;
            let reply = self
                .container_defer
                .get_or_join((worker_id.clone(), container.id.clone()), || async move {
                    call_with_timeout(timeout, api.supports_container(&container)).await
                })
                .await;
            match reply {
                Ok(reply) if reply.support => {
                    self.note_worker_seen(&worker_id);
                    found = Some(worker_id);
                    break;
                }
                Ok(_) => {
                    self.note_worker_seen(&worker_id);
                }
                Err(err) => {
                    tracing::debug!(worker = %worker_id, error = %err, "container probe failed");
                    lost.push(worker_id);
                }
            }
        }
        for worker_id in lost {
            self.handle_worker_disconnect(&worker_id);
        }
        found
    }

    fn container_worker_failed(
        &mut self,
        id: &ContainerId,
        worker_id: &WorkerId,
        err: WorkerError,
        before: (Option<bool>, Reason),
    ) {
        let now = self.clock.now();
        tracing::warn!(container = %id, worker = %worker_id, error = %err, "container duty failed");
        self.handle_worker_disconnect(worker_id);
        if let Some(tracked) = self.containers.get_mut(id) {
            tracked.assigned_worker = None;
            tracked.monitors_set_up = false;
            tracked.status_ok = Some(false);
            tracked.reason = Reason::new(
                "Lost contact with the container's worker",
                format!("worker {worker_id}: {err}"),
            );
            tracked.next_check = Some(now + self.cfg.container_cron_interval);
        }
        self.publish_container_status_if_changed(id, before);
    }

    fn publish_container_status_if_changed(
        &mut self,
        id: &ContainerId,
        before: (Option<bool>, Reason),
    ) {
        let Some(tracked) = self.containers.get(id) else {
            return;
        };
        if (tracked.status_ok, tracked.reason.clone()) == before {
            return;
        }
        let record = ContainerStatusRecord {
            id: id.clone(),
            ok: tracked.status_ok.unwrap_or(false),
            reason: tracked.reason.clone(),
            timestamp: self.clock.now_utc(),
        };
        let now = self.clock.now();
        self.publisher.enqueue_container(record, now);
    }
}
