// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Registry connecting expectation managers and workers
//!
//! The workforce does not route job traffic. It tells workers which
//! managers exist so they can dial in directly, tracks liveness through
//! heartbeats, and fans out join/leave notices. If the workforce dies,
//! in-flight work keeps running; only new joins stop.

use crate::clock::Clock;
use crate::config::WorkforceConfig;
use crate::manager::ManagerId;
use crate::worker::{WorkerCapabilities, WorkerId};
use std::collections::HashMap;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;

/// Notification fanned out to registered parties
#[derive(Debug, Clone, PartialEq)]
pub enum WorkforceNotice {
    /// A manager is reachable at the given endpoint; workers should dial in
    ManagerAvailable { id: ManagerId, endpoint: String },
    ManagerLost { id: ManagerId },
    WorkerAvailable {
        id: WorkerId,
        capabilities: WorkerCapabilities,
    },
    WorkerLost { id: WorkerId },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkforceError {
    #[error("unknown manager: {0}")]
    UnknownManager(ManagerId),
    #[error("unknown worker: {0}")]
    UnknownWorker(WorkerId),
}

struct ManagerEntry {
    endpoint: String,
    last_seen: Instant,
    tx: mpsc::UnboundedSender<WorkforceNotice>,
}

struct WorkerEntry {
    capabilities: WorkerCapabilities,
    last_seen: Instant,
    tx: mpsc::UnboundedSender<WorkforceNotice>,
}

/// The singleton registry of managers and workers
pub struct Workforce {
    cfg: WorkforceConfig,
    managers: HashMap<ManagerId, ManagerEntry>,
    workers: HashMap<WorkerId, WorkerEntry>,
}

impl Workforce {
    pub fn new(cfg: WorkforceConfig) -> Self {
        Self {
            cfg,
            managers: HashMap::new(),
            workers: HashMap::new(),
        }
    }

    /// Register (or re-register) a manager. Idempotent: a repeat with the
    /// same endpoint only refreshes the channel. A new endpoint is fanned
    /// out to every connected worker so they can dial in.
    pub fn register_manager(
        &mut self,
        id: ManagerId,
        endpoint: impl Into<String>,
        clock: &impl Clock,
    ) -> mpsc::UnboundedReceiver<WorkforceNotice> {
        let endpoint = endpoint.into();
        let now = clock.now();
        let (tx, rx) = mpsc::unbounded_channel();

        // The fresh manager learns about every current worker
        for (worker_id, entry) in &self.workers {
            let _ = tx.send(WorkforceNotice::WorkerAvailable {
                id: worker_id.clone(),
                capabilities: entry.capabilities.clone(),
            });
        }

        let endpoint_changed = self
            .managers
            .get(&id)
            .map(|entry| entry.endpoint != endpoint)
            .unwrap_or(true);

        self.managers.insert(
            id.clone(),
            ManagerEntry {
                endpoint: endpoint.clone(),
                last_seen: now,
                tx,
            },
        );

        if endpoint_changed {
            tracing::info!(manager = %id, endpoint = %endpoint, "manager registered");
            let notice = WorkforceNotice::ManagerAvailable {
                id: id.clone(),
                endpoint,
            };
            for entry in self.workers.values() {
                let _ = entry.tx.send(notice.clone());
            }
        }

        rx
    }

    /// Register (or re-register) a worker; it immediately receives the
    /// endpoint of every current manager.
    pub fn register_worker(
        &mut self,
        id: WorkerId,
        capabilities: WorkerCapabilities,
        clock: &impl Clock,
    ) -> mpsc::UnboundedReceiver<WorkforceNotice> {
        let now = clock.now();
        let (tx, rx) = mpsc::unbounded_channel();

        for (manager_id, entry) in &self.managers {
            let _ = tx.send(WorkforceNotice::ManagerAvailable {
                id: manager_id.clone(),
                endpoint: entry.endpoint.clone(),
            });
        }

        let is_new = !self.workers.contains_key(&id);
        self.workers.insert(
            id.clone(),
            WorkerEntry {
                capabilities: capabilities.clone(),
                last_seen: now,
                tx,
            },
        );

        if is_new {
            tracing::info!(worker = %id, "worker registered");
            let notice = WorkforceNotice::WorkerAvailable { id, capabilities };
            for entry in self.managers.values() {
                let _ = entry.tx.send(notice.clone());
            }
        }

        rx
    }

    pub fn unregister_manager(&mut self, id: &ManagerId) {
        if self.managers.remove(id).is_some() {
            tracing::info!(manager = %id, "manager unregistered");
            let notice = WorkforceNotice::ManagerLost { id: id.clone() };
            for entry in self.workers.values() {
                let _ = entry.tx.send(notice.clone());
            }
        }
    }

    pub fn unregister_worker(&mut self, id: &WorkerId) {
        if self.workers.remove(id).is_some() {
            tracing::info!(worker = %id, "worker unregistered");
            let notice = WorkforceNotice::WorkerLost { id: id.clone() };
            for entry in self.managers.values() {
                let _ = entry.tx.send(notice.clone());
            }
        }
    }

    pub fn heartbeat_manager(
        &mut self,
        id: &ManagerId,
        clock: &impl Clock,
    ) -> Result<(), WorkforceError> {
        match self.managers.get_mut(id) {
            Some(entry) => {
                entry.last_seen = clock.now();
                Ok(())
            }
            None => Err(WorkforceError::UnknownManager(id.clone())),
        }
    }

    pub fn heartbeat_worker(
        &mut self,
        id: &WorkerId,
        clock: &impl Clock,
    ) -> Result<(), WorkforceError> {
        match self.workers.get_mut(id) {
            Some(entry) => {
                entry.last_seen = clock.now();
                Ok(())
            }
            None => Err(WorkforceError::UnknownWorker(id.clone())),
        }
    }

    /// Drop parties whose heartbeat lapsed, fanning disconnect notices out
    /// to everyone still registered. Returns the emitted notices.
    pub fn prune_expired(&mut self, clock: &impl Clock) -> Vec<WorkforceNotice> {
        let now = clock.now();
        let timeout = self.cfg.heartbeat_timeout;

        let dead_managers: Vec<ManagerId> = self
            .managers
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_seen) > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        let dead_workers: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_seen) > timeout)
            .map(|(id, _)| id.clone())
            .collect();

        let mut notices = Vec::new();
        for id in dead_managers {
            tracing::warn!(manager = %id, "manager heartbeat lapsed");
            self.unregister_manager(&id);
            notices.push(WorkforceNotice::ManagerLost { id });
        }
        for id in dead_workers {
            tracing::warn!(worker = %id, "worker heartbeat lapsed");
            self.unregister_worker(&id);
            notices.push(WorkforceNotice::WorkerLost { id });
        }
        notices
    }

    pub fn list_workers(&self) -> Vec<(WorkerId, WorkerCapabilities)> {
        let mut workers: Vec<(WorkerId, WorkerCapabilities)> = self
            .workers
            .iter()
            .map(|(id, entry)| (id.clone(), entry.capabilities.clone()))
            .collect();
        workers.sort_by(|a, b| a.0.cmp(&b.0));
        workers
    }

    pub fn list_managers(&self) -> Vec<(ManagerId, String)> {
        let mut managers: Vec<(ManagerId, String)> = self
            .managers
            .iter()
            .map(|(id, entry)| (id.clone(), entry.endpoint.clone()))
            .collect();
        managers.sort_by(|a, b| a.0 .0.cmp(&b.0 .0));
        managers
    }
}
