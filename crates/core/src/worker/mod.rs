// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The worker side of the engine: the logical RPC contract, the manager's
//! view of a connected worker, and the fake used by tests

mod agent;
mod api;
mod fake;

pub use agent::WorkerAgent;
pub use api::{
    call_with_timeout, CostReply, CronReply, FulfilledReply, MonitorReply, ReadyReply, RemoveReply,
    SupportReply, WorkerApi,
};
pub use fake::{FakeWorker, WorkerCall};

use crate::reason::Reason;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Unique identifier for a worker
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub String);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        WorkerId(s.to_string())
    }
}

/// Identifier of one piece of work running on a worker
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkInProgressId(pub String);

impl std::fmt::Display for WorkInProgressId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for WorkInProgressId {
    fn from(s: &str) -> Self {
        WorkInProgressId(s.to_string())
    }
}

/// Static capabilities a worker declares when connecting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCapabilities {
    /// How many expectations the worker accepts concurrently
    pub concurrency_limit: usize,
}

impl Default for WorkerCapabilities {
    fn default() -> Self {
        Self {
            concurrency_limit: 2,
        }
    }
}

/// Errors from calls to a worker
#[derive(Debug, Clone, Error)]
pub enum WorkerError {
    #[error("worker unreachable: {0}")]
    Unreachable(String),
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed reply: {0}")]
    MalformedReply(String),
    /// The worker declined the job (busy); not a transport fault
    #[error("work rejected: {0}")]
    Rejected(String),
}

impl WorkerError {
    /// Transport-class errors quarantine the worker; rejections do not
    pub fn is_transport(&self) -> bool {
        !matches!(self, WorkerError::Rejected(_))
    }
}

/// An event reported by a worker about a running job
#[derive(Debug, Clone, PartialEq)]
pub enum JobEventKind {
    Progress { fraction: f64 },
    Done { actual_version_hash: String },
    Error { reason: Reason },
}

/// A job event together with its origin
///
/// Workers deliver these directly into the manager's update channel; order
/// across jobs is not guaranteed, so consumers match on the work id.
#[derive(Debug, Clone, PartialEq)]
pub struct JobUpdate {
    pub worker: WorkerId,
    pub wip: WorkInProgressId,
    pub event: JobEventKind,
}

/// Sender handed to a worker when it connects to a manager
pub type JobSender = mpsc::UnboundedSender<JobUpdate>;
/// Receiving side, owned by the manager
pub type JobReceiver = mpsc::UnboundedReceiver<JobUpdate>;
