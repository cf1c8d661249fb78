// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The status-out seam to the upstream control plane
//!
//! The control plane itself is an external collaborator: expectations come
//! in through the manager's ingest calls, and status records go out
//! through this trait.

use crate::manager::{ContainerStatusRecord, StatusRecord};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Errors from publishing status upstream
#[derive(Debug, Clone, Error)]
pub enum PublishError {
    #[error("upstream unavailable: {0}")]
    Unavailable(String),
}

/// Receives status records from the manager
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn publish_expectation_statuses(
        &self,
        batch: Vec<StatusRecord>,
    ) -> Result<(), PublishError>;

    async fn publish_container_statuses(
        &self,
        batch: Vec<ContainerStatusRecord>,
    ) -> Result<(), PublishError>;
}

#[derive(Default)]
struct FakeUpstreamState {
    expectation_records: Vec<StatusRecord>,
    container_records: Vec<ContainerStatusRecord>,
    batches: usize,
    fail_remaining: usize,
}

/// Recording upstream for tests, with scriptable failures
#[derive(Clone, Default)]
pub struct FakeUpstream {
    state: Arc<Mutex<FakeUpstreamState>>,
}

impl FakeUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` publish calls fail
    pub fn fail_times(&self, n: usize) {
        self.lock().fail_remaining = n;
    }

    /// All expectation records received, in arrival order
    pub fn expectation_records(&self) -> Vec<StatusRecord> {
        self.lock().expectation_records.clone()
    }

    /// Records received for one expectation id, in arrival order
    pub fn records_for(&self, id: &str) -> Vec<StatusRecord> {
        self.lock()
            .expectation_records
            .iter()
            .filter(|r| r.id.0 == id)
            .cloned()
            .collect()
    }

    /// The state sequence upstream observed for one expectation id
    pub fn states_for(&self, id: &str) -> Vec<crate::manager::ExpectationState> {
        self.records_for(id).into_iter().map(|r| r.state).collect()
    }

    pub fn container_records(&self) -> Vec<ContainerStatusRecord> {
        self.lock().container_records.clone()
    }

    pub fn batch_count(&self) -> usize {
        self.lock().batches
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeUpstreamState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Upstream for FakeUpstream {
    async fn publish_expectation_statuses(
        &self,
        batch: Vec<StatusRecord>,
    ) -> Result<(), PublishError> {
        let mut state = self.lock();
        if state.fail_remaining > 0 {
            state.fail_remaining -= 1;
            return Err(PublishError::Unavailable("scripted failure".to_string()));
        }
        state.batches += 1;
        state.expectation_records.extend(batch);
        Ok(())
    }

    async fn publish_container_statuses(
        &self,
        batch: Vec<ContainerStatusRecord>,
    ) -> Result<(), PublishError> {
        let mut state = self.lock();
        if state.fail_remaining > 0 {
            state.fail_remaining -= 1;
            return Err(PublishError::Unavailable("scripted failure".to_string()));
        }
        state.batches += 1;
        state.container_records.extend(batch);
        Ok(())
    }
}
