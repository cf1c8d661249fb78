// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The logical RPC a manager speaks to a worker
//!
//! Workers are stateless executors: given the full expectation (sources,
//! targets, accessors, version), they answer capability questions and carry
//! out work. Every call is fallible at the transport layer; callers wrap
//! calls in [`call_with_timeout`] so no wait is unbounded.

use super::{WorkInProgressId, WorkerCapabilities, WorkerError, WorkerId};
use crate::package::{Expectation, PackageContainer, WorkOptions};
use crate::reason::Reason;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Answer to a capability probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupportReply {
    pub support: bool,
    pub reason: Reason,
}

/// Cost estimate for performing an expectation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostReply {
    /// Scalar cost; lower is better. Factors network locality and load.
    pub cost: f64,
    pub reason: Option<Reason>,
}

/// Whether the worker could start working right now
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadyReply {
    pub ready: bool,
    /// Not ready because some other expectation must complete first
    pub is_waiting_for_another: bool,
    pub source_exists: Option<bool>,
    pub reason: Reason,
}

/// Whether the expectation is already fulfilled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FulfilledReply {
    pub fulfilled: bool,
    pub reason: Reason,
    pub actual_version_hash: Option<String>,
}

/// Result of removal work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveReply {
    pub removed: bool,
    pub reason: Option<Reason>,
}

/// Result of a container cleanup cron run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronReply {
    pub ok: bool,
    pub reason: Option<Reason>,
}

/// Result of setting up container monitors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorReply {
    pub ok: bool,
    pub monitor_count: usize,
    pub reason: Option<Reason>,
}

/// The calls a worker answers
///
/// Job events (`progress` / `done` / `error`) flow back over the
/// [`JobSender`](super::JobSender) channel the worker received when it
/// connected, not as return values: a worker may report completions in any
/// order.
#[async_trait]
pub trait WorkerApi: Send + Sync {
    fn id(&self) -> WorkerId;

    fn capabilities(&self) -> WorkerCapabilities;

    /// Can this worker handle the expectation at all?
    async fn supports_expectation(&self, exp: &Expectation) -> Result<SupportReply, WorkerError>;

    /// How expensive would it be for this worker?
    async fn cost_for_expectation(&self, exp: &Expectation) -> Result<CostReply, WorkerError>;

    /// Could work start now (sources present, no blockers)?
    async fn is_ready_to_start(&self, exp: &Expectation) -> Result<ReadyReply, WorkerError>;

    /// Is the expectation fulfilled? `was_fulfilled` distinguishes periodic
    /// re-verification from a first-time check.
    async fn is_fulfilled(
        &self,
        exp: &Expectation,
        was_fulfilled: bool,
    ) -> Result<FulfilledReply, WorkerError>;

    /// Start the work; events stream back over the job channel
    async fn work_on(
        &self,
        exp: &Expectation,
        options: &WorkOptions,
    ) -> Result<WorkInProgressId, WorkerError>;

    /// Undo the expectation's effects (used when an expectation is removed)
    async fn remove_expectation(&self, exp: &Expectation) -> Result<RemoveReply, WorkerError>;

    /// Best-effort cancellation of running work
    async fn cancel_work(&self, wip: &WorkInProgressId) -> Result<(), WorkerError>;

    /// Can this worker take on server-side duties for the container?
    async fn supports_container(
        &self,
        container: &PackageContainer,
    ) -> Result<SupportReply, WorkerError>;

    /// Run the container's periodic cleanup
    async fn run_container_cron(
        &self,
        container: &PackageContainer,
    ) -> Result<CronReply, WorkerError>;

    /// Install monitors on the container
    async fn setup_container_monitors(
        &self,
        container: &PackageContainer,
    ) -> Result<MonitorReply, WorkerError>;
}

/// Bound a worker call; an elapsed timeout is a transport error
pub async fn call_with_timeout<T>(
    timeout: Duration,
    call: impl Future<Output = Result<T, WorkerError>>,
) -> Result<T, WorkerError> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(WorkerError::Timeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn call_with_timeout_passes_results_through() {
        let result = call_with_timeout(Duration::from_secs(1), async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn call_with_timeout_converts_elapsed_to_transport_error() {
        let result: Result<(), WorkerError> =
            call_with_timeout(Duration::from_millis(10), async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(WorkerError::Timeout(_))));
    }
}
