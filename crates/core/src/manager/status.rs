// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Status publication with coalescing and bounded retry
//!
//! Every transition enqueues a status record. Records for the same id
//! coalesce inside a publication window, latest wins, so upstream sees the
//! causal order of states per expectation without a flood of intermediate
//! chatter. Publish failures back off and re-merge the batch; a pending
//! record is only ever replaced by a newer record for the same id.

use super::tracked::ExpectationState;
use crate::package::{ContainerId, ExpectationId};
use crate::reason::Reason;
use crate::upstream::Upstream;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// A per-expectation status record surfaced upstream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub id: ExpectationId,
    pub state: ExpectationState,
    pub reason: Reason,
    pub is_error: bool,
    pub status_info: Option<String>,
    pub progress: Option<f64>,
    pub actual_version_hash: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// A per-container status record surfaced upstream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerStatusRecord {
    pub id: ContainerId,
    pub ok: bool,
    pub reason: Reason,
    pub timestamp: DateTime<Utc>,
}

/// Coalescing queue between the evaluation loop and the upstream bridge
///
/// Single-producer (the loop), single-consumer (the flush).
pub struct StatusPublisher {
    window: Duration,
    retry_base: Duration,
    retry_max: Duration,

    pending: HashMap<ExpectationId, StatusRecord>,
    pending_containers: HashMap<ContainerId, ContainerStatusRecord>,
    window_deadline: Option<Instant>,
    consecutive_failures: u32,
    retry_at: Option<Instant>,
}

impl StatusPublisher {
    pub fn new(window: Duration, retry_base: Duration, retry_max: Duration) -> Self {
        Self {
            window,
            retry_base,
            retry_max,
            pending: HashMap::new(),
            pending_containers: HashMap::new(),
            window_deadline: None,
            consecutive_failures: 0,
            retry_at: None,
        }
    }

    /// Queue a record; a newer record for the same id supersedes it
    pub fn enqueue(&mut self, record: StatusRecord, now: Instant) {
        self.pending.insert(record.id.clone(), record);
        self.window_deadline.get_or_insert(now + self.window);
    }

    pub fn enqueue_container(&mut self, record: ContainerStatusRecord, now: Instant) {
        self.pending_containers.insert(record.id.clone(), record);
        self.window_deadline.get_or_insert(now + self.window);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len() + self.pending_containers.len()
    }

    /// Whether a publication should happen now
    pub fn due(&self, now: Instant) -> bool {
        if self.pending.is_empty() && self.pending_containers.is_empty() {
            return false;
        }
        if let Some(retry_at) = self.retry_at {
            return retry_at <= now;
        }
        self.window_deadline.is_some_and(|deadline| deadline <= now)
    }

    /// Publish everything pending; on failure, keep the batch for retry
    pub async fn flush(&mut self, upstream: &dyn Upstream, now: Instant) -> bool {
        let mut batch: Vec<StatusRecord> = self.pending.drain().map(|(_, r)| r).collect();
        batch.sort_by(|a, b| a.id.cmp(&b.id));
        let mut container_batch: Vec<ContainerStatusRecord> =
            self.pending_containers.drain().map(|(_, r)| r).collect();
        container_batch.sort_by(|a, b| a.id.cmp(&b.id));
        self.window_deadline = None;

        let result = async {
            if !batch.is_empty() {
                upstream.publish_expectation_statuses(batch.clone()).await?;
            }
            if !container_batch.is_empty() {
                upstream
                    .publish_container_statuses(container_batch.clone())
                    .await?;
            }
            Ok::<(), crate::upstream::PublishError>(())
        }
        .await;

        match result {
            Ok(()) => {
                self.consecutive_failures = 0;
                self.retry_at = None;
                true
            }
            Err(err) => {
                self.consecutive_failures += 1;
                let delay = self
                    .retry_base
                    .saturating_mul(2u32.saturating_pow(self.consecutive_failures.min(16) - 1))
                    .min(self.retry_max);
                self.retry_at = Some(now + delay);
                tracing::warn!(
                    error = %err,
                    failures = self.consecutive_failures,
                    retry_in = ?delay,
                    "status publish failed"
                );

                // Re-merge: anything enqueued during the publish is newer
                // and wins over the failed batch
                for record in batch {
                    self.pending.entry(record.id.clone()).or_insert(record);
                }
                for record in container_batch {
                    self.pending_containers
                        .entry(record.id.clone())
                        .or_insert(record);
                }
                false
            }
        }
    }
}
