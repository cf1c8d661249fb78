// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error taxonomy for the evaluation loop
//!
//! Evaluation steps return `Result<_, EvalError>` instead of throwing; the
//! loop interprets the class of an error to pick the next state. Transport
//! failures are never charged against an expectation, worker-reported
//! failures are, config problems park the expectation until its definition
//! changes, and internal faults reset it defensively.

use crate::reason::Reason;
use crate::worker::{WorkerError, WorkerId};
use thiserror::Error;

/// An error produced while evaluating one expectation
#[derive(Debug, Error)]
pub enum EvalError {
    /// The worker could not be reached, timed out, or replied garbage.
    /// Not the expectation's fault: the worker is quarantined and the
    /// expectation re-selects without incrementing its error count.
    #[error("transport failure talking to worker {worker}: {source}")]
    Transport {
        worker: WorkerId,
        #[source]
        source: WorkerError,
    },

    /// The worker explicitly reported that the expectation cannot proceed.
    /// Counted against the expectation; backoff applies.
    #[error("worker {worker} reported: {}", reason.tech)]
    WorkerReported { worker: WorkerId, reason: Reason },

    /// The expectation definition is malformed. Parked until upstream
    /// updates the definition.
    #[error("invalid expectation: {0}")]
    Config(String),

    /// A manager-side fault. The expectation is reset and the loop continues.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EvalError {
    /// Whether this error came from the transport rather than the work itself
    pub fn is_transport(&self) -> bool {
        matches!(self, EvalError::Transport { .. })
    }

    /// The worker involved, if any
    pub fn worker(&self) -> Option<&WorkerId> {
        match self {
            EvalError::Transport { worker, .. } | EvalError::WorkerReported { worker, .. } => {
                Some(worker)
            }
            _ => None,
        }
    }

    /// Reason pair surfaced upstream when this error resets an expectation
    pub fn to_reason(&self) -> Reason {
        match self {
            EvalError::Transport { worker, source } => Reason::new(
                "Lost contact with worker",
                format!("transport failure, worker {worker}: {source}"),
            ),
            EvalError::WorkerReported { reason, .. } => reason.clone(),
            EvalError::Config(problem) => {
                Reason::new("Expectation is invalid", format!("config: {problem}"))
            }
            EvalError::Internal(context) => {
                Reason::new("Internal error", format!("internal: {context}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_classified() {
        let err = EvalError::Transport {
            worker: WorkerId::from("w1"),
            source: WorkerError::Unreachable("connection refused".into()),
        };
        assert!(err.is_transport());
        assert_eq!(err.worker().map(|w| w.to_string()), Some("w1".to_string()));
    }

    #[test]
    fn worker_reported_errors_keep_their_reason() {
        let err = EvalError::WorkerReported {
            worker: WorkerId::from("w1"),
            reason: Reason::new("Source file is missing", "ENOENT /src/a.mp4"),
        };
        assert!(!err.is_transport());
        assert_eq!(err.to_reason().user, "Source file is missing");
    }

    #[test]
    fn config_errors_have_no_worker() {
        let err = EvalError::Config("no sources".into());
        assert!(err.worker().is_none());
        assert!(err.to_reason().tech.contains("no sources"));
    }
}
