//! Fake worker implementation for testing
//!
//! Records every call and answers from scripted state, so tests can walk an
//! expectation through its whole lifecycle without any real executor. Job
//! events are pushed into the connected manager's channel exactly like a
//! real worker would.

use super::api::*;
use super::{
    JobEventKind, JobSender, JobUpdate, WorkInProgressId, WorkerCapabilities, WorkerError, WorkerId,
};
use crate::package::{
    AccessorKind, ContainerId, Expectation, ExpectationId, PackageContainer, WorkOptions,
};
use crate::reason::Reason;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

/// Recorded call to a worker method
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerCall {
    SupportsExpectation { id: ExpectationId },
    CostForExpectation { id: ExpectationId },
    IsReadyToStart { id: ExpectationId },
    IsFulfilled { id: ExpectationId, was_fulfilled: bool },
    WorkOn { id: ExpectationId },
    RemoveExpectation { id: ExpectationId },
    CancelWork { wip: WorkInProgressId },
    SupportsContainer { id: ContainerId },
    RunContainerCron { id: ContainerId },
    SetupContainerMonitors { id: ContainerId },
}

struct ActiveJob {
    exp_id: ExpectationId,
    content_hash: String,
}

struct FakeWorkerState {
    capabilities: WorkerCapabilities,
    calls: Vec<WorkerCall>,
    job_tx: Option<JobSender>,

    // Capability scripting
    supported_source_kinds: Option<HashSet<AccessorKind>>,
    support_override: Option<bool>,
    cost: f64,

    // Readiness scripting
    ready: bool,
    waiting_for_another: bool,
    source_missing: bool,

    // Fulfillment state: expectation id to actual version hash
    fulfilled: HashMap<ExpectationId, String>,

    // Work behavior
    auto_complete_work: bool,
    reject_work: bool,
    active_jobs: HashMap<WorkInProgressId, ActiveJob>,

    // Failure modes
    fail_transport: bool,
    remove_fails: Option<Reason>,
    support_container: bool,
}

impl Default for FakeWorkerState {
    fn default() -> Self {
        Self {
            capabilities: WorkerCapabilities::default(),
            calls: Vec::new(),
            job_tx: None,
            supported_source_kinds: None,
            support_override: None,
            cost: 1.0,
            ready: true,
            waiting_for_another: false,
            source_missing: false,
            fulfilled: HashMap::new(),
            auto_complete_work: false,
            reject_work: false,
            active_jobs: HashMap::new(),
            fail_transport: false,
            remove_fails: None,
            support_container: true,
        }
    }
}

impl FakeWorkerState {
    fn guard(&self) -> Result<(), WorkerError> {
        if self.fail_transport {
            Err(WorkerError::Unreachable("fake worker offline".to_string()))
        } else {
            Ok(())
        }
    }

    /// Mark a job done and push the event; `hash` overrides the content hash
    fn finish_job(&mut self, worker: &WorkerId, wip: &WorkInProgressId, hash: Option<String>) {
        let Some(job) = self.active_jobs.remove(wip) else {
            return;
        };
        let hash = hash.unwrap_or(job.content_hash);
        self.fulfilled.insert(job.exp_id, hash.clone());
        if let Some(tx) = &self.job_tx {
            let _ = tx.send(JobUpdate {
                worker: worker.clone(),
                wip: wip.clone(),
                event: JobEventKind::Done {
                    actual_version_hash: hash,
                },
            });
        }
    }
}

/// Scriptable worker with call recording for testing
#[derive(Clone)]
pub struct FakeWorker {
    id: WorkerId,
    state: Arc<Mutex<FakeWorkerState>>,
}

impl FakeWorker {
    pub fn new(id: &str) -> Self {
        Self {
            id: WorkerId::from(id),
            state: Arc::new(Mutex::new(FakeWorkerState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeWorkerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Hand the worker the manager's job channel, as happens on connect
    pub fn connect_job_channel(&self, tx: JobSender) {
        self.lock().job_tx = Some(tx);
    }

    // ==================== scripting ====================

    pub fn set_concurrency_limit(&self, limit: usize) {
        self.lock().capabilities.concurrency_limit = limit;
    }

    /// Restrict which source accessor kinds this worker can read
    pub fn set_supported_source_kinds(&self, kinds: impl IntoIterator<Item = AccessorKind>) {
        self.lock().supported_source_kinds = Some(kinds.into_iter().collect());
    }

    /// Hard-override the support answer
    pub fn set_support(&self, support: bool) {
        self.lock().support_override = Some(support);
    }

    pub fn set_cost(&self, cost: f64) {
        self.lock().cost = cost;
    }

    pub fn set_ready(&self, ready: bool) {
        self.lock().ready = ready;
    }

    pub fn set_waiting_for_another(&self, waiting: bool) {
        self.lock().waiting_for_another = waiting;
    }

    pub fn set_source_missing(&self, missing: bool) {
        self.lock().source_missing = missing;
    }

    /// Make every call fail as if the worker vanished
    pub fn set_transport_failure(&self, failing: bool) {
        self.lock().fail_transport = failing;
    }

    pub fn set_reject_work(&self, reject: bool) {
        self.lock().reject_work = reject;
    }

    /// Complete jobs synchronously inside `work_on`
    pub fn set_auto_complete(&self, auto: bool) {
        self.lock().auto_complete_work = auto;
    }

    pub fn set_remove_fails(&self, reason: Option<Reason>) {
        self.lock().remove_fails = reason;
    }

    pub fn set_supports_container(&self, support: bool) {
        self.lock().support_container = support;
    }

    /// Script the expectation as already fulfilled with the given hash
    pub fn set_fulfilled(&self, id: &ExpectationId, hash: &str) {
        self.lock().fulfilled.insert(id.clone(), hash.to_string());
    }

    /// Script the expectation as no longer fulfilled (e.g. file deleted)
    pub fn clear_fulfilled(&self, id: &ExpectationId) {
        self.lock().fulfilled.remove(id);
    }

    // ==================== job control ====================

    /// Jobs currently running on this worker
    pub fn active_jobs(&self) -> Vec<(WorkInProgressId, ExpectationId)> {
        self.lock()
            .active_jobs
            .iter()
            .map(|(wip, job)| (wip.clone(), job.exp_id.clone()))
            .collect()
    }

    pub fn push_progress(&self, wip: &WorkInProgressId, fraction: f64) {
        let state = self.lock();
        if let Some(tx) = &state.job_tx {
            let _ = tx.send(JobUpdate {
                worker: self.id.clone(),
                wip: wip.clone(),
                event: JobEventKind::Progress { fraction },
            });
        }
    }

    /// Complete a running job, reporting the package's content hash
    pub fn complete_job(&self, wip: &WorkInProgressId) {
        self.lock().finish_job(&self.id, wip, None);
    }

    /// Complete a running job with an explicit (possibly wrong) hash
    pub fn complete_job_with(&self, wip: &WorkInProgressId, hash: &str) {
        self.lock().finish_job(&self.id, wip, Some(hash.to_string()));
    }

    /// Fail a running job with a worker-reported error
    pub fn fail_job(&self, wip: &WorkInProgressId, reason: Reason) {
        let mut state = self.lock();
        state.active_jobs.remove(wip);
        if let Some(tx) = &state.job_tx {
            let _ = tx.send(JobUpdate {
                worker: self.id.clone(),
                wip: wip.clone(),
                event: JobEventKind::Error { reason },
            });
        }
    }

    // ==================== inspection ====================

    /// Get all recorded calls
    pub fn calls(&self) -> Vec<WorkerCall> {
        self.lock().calls.clone()
    }

    /// Clear recorded calls
    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }
}

#[async_trait]
impl WorkerApi for FakeWorker {
    fn id(&self) -> WorkerId {
        self.id.clone()
    }

    fn capabilities(&self) -> WorkerCapabilities {
        self.lock().capabilities.clone()
    }

    async fn supports_expectation(&self, exp: &Expectation) -> Result<SupportReply, WorkerError> {
        let mut state = self.lock();
        state.calls.push(WorkerCall::SupportsExpectation {
            id: exp.id.clone(),
        });
        state.guard()?;

        if let Some(support) = state.support_override {
            return Ok(SupportReply {
                support,
                reason: Reason::user_only(if support {
                    "Supported"
                } else {
                    "Not supported"
                }),
            });
        }

        let source_ok = exp.start_requirement.sources.iter().any(|source| {
            source.readable_kinds().any(|kind| {
                exp.package.accepts_source_kind(kind)
                    && state
                        .supported_source_kinds
                        .as_ref()
                        .map(|kinds| kinds.contains(&kind))
                        .unwrap_or(true)
            })
        });
        let target_ok = exp
            .end_requirement
            .targets
            .iter()
            .any(|t| t.has_writable_accessor());

        if source_ok && target_ok {
            Ok(SupportReply {
                support: true,
                reason: Reason::user_only("Supported"),
            })
        } else {
            Ok(SupportReply {
                support: false,
                reason: Reason::new(
                    "No access to the package",
                    format!("source_ok={source_ok} target_ok={target_ok}"),
                ),
            })
        }
    }

    async fn cost_for_expectation(&self, exp: &Expectation) -> Result<CostReply, WorkerError> {
        let mut state = self.lock();
        state.calls.push(WorkerCall::CostForExpectation {
            id: exp.id.clone(),
        });
        state.guard()?;
        Ok(CostReply {
            cost: state.cost,
            reason: None,
        })
    }

    async fn is_ready_to_start(&self, exp: &Expectation) -> Result<ReadyReply, WorkerError> {
        let mut state = self.lock();
        state.calls.push(WorkerCall::IsReadyToStart {
            id: exp.id.clone(),
        });
        state.guard()?;

        if state.source_missing {
            return Ok(ReadyReply {
                ready: false,
                is_waiting_for_another: false,
                source_exists: Some(false),
                reason: Reason::user_only("Source package does not exist"),
            });
        }
        if state.waiting_for_another {
            return Ok(ReadyReply {
                ready: false,
                is_waiting_for_another: true,
                source_exists: Some(true),
                reason: Reason::user_only("Waiting for another expectation to finish"),
            });
        }
        if !state.ready {
            return Ok(ReadyReply {
                ready: false,
                is_waiting_for_another: false,
                source_exists: None,
                reason: Reason::user_only("Not ready"),
            });
        }
        Ok(ReadyReply {
            ready: true,
            is_waiting_for_another: false,
            source_exists: Some(true),
            reason: Reason::default(),
        })
    }

    async fn is_fulfilled(
        &self,
        exp: &Expectation,
        was_fulfilled: bool,
    ) -> Result<FulfilledReply, WorkerError> {
        let mut state = self.lock();
        state.calls.push(WorkerCall::IsFulfilled {
            id: exp.id.clone(),
            was_fulfilled,
        });
        state.guard()?;

        match state.fulfilled.get(&exp.id) {
            Some(hash) => Ok(FulfilledReply {
                fulfilled: true,
                reason: Reason::default(),
                actual_version_hash: Some(hash.clone()),
            }),
            None => Ok(FulfilledReply {
                fulfilled: false,
                reason: Reason::user_only("Package not present on target"),
                actual_version_hash: None,
            }),
        }
    }

    async fn work_on(
        &self,
        exp: &Expectation,
        _options: &WorkOptions,
    ) -> Result<WorkInProgressId, WorkerError> {
        let mut state = self.lock();
        state.calls.push(WorkerCall::WorkOn { id: exp.id.clone() });
        state.guard()?;

        if state.reject_work {
            return Err(WorkerError::Rejected("worker is busy".to_string()));
        }
        if state.active_jobs.len() >= state.capabilities.concurrency_limit {
            return Err(WorkerError::Rejected(
                "concurrency limit reached".to_string(),
            ));
        }

        let wip = WorkInProgressId(uuid::Uuid::new_v4().to_string());
        state.active_jobs.insert(
            wip.clone(),
            ActiveJob {
                exp_id: exp.id.clone(),
                content_hash: exp.content_version_hash.clone(),
            },
        );

        if state.auto_complete_work {
            let id = self.id.clone();
            state.finish_job(&id, &wip, None);
        }

        Ok(wip)
    }

    async fn remove_expectation(&self, exp: &Expectation) -> Result<RemoveReply, WorkerError> {
        let mut state = self.lock();
        state.calls.push(WorkerCall::RemoveExpectation {
            id: exp.id.clone(),
        });
        state.guard()?;

        if let Some(reason) = state.remove_fails.clone() {
            return Ok(RemoveReply {
                removed: false,
                reason: Some(reason),
            });
        }
        state.fulfilled.remove(&exp.id);
        Ok(RemoveReply {
            removed: true,
            reason: None,
        })
    }

    async fn cancel_work(&self, wip: &WorkInProgressId) -> Result<(), WorkerError> {
        let mut state = self.lock();
        state.calls.push(WorkerCall::CancelWork { wip: wip.clone() });
        state.guard()?;
        state.active_jobs.remove(wip);
        Ok(())
    }

    async fn supports_container(
        &self,
        container: &PackageContainer,
    ) -> Result<SupportReply, WorkerError> {
        let mut state = self.lock();
        state.calls.push(WorkerCall::SupportsContainer {
            id: container.id.clone(),
        });
        state.guard()?;
        Ok(SupportReply {
            support: state.support_container,
            reason: Reason::default(),
        })
    }

    async fn run_container_cron(
        &self,
        container: &PackageContainer,
    ) -> Result<CronReply, WorkerError> {
        let mut state = self.lock();
        state.calls.push(WorkerCall::RunContainerCron {
            id: container.id.clone(),
        });
        state.guard()?;
        Ok(CronReply {
            ok: true,
            reason: None,
        })
    }

    async fn setup_container_monitors(
        &self,
        container: &PackageContainer,
    ) -> Result<MonitorReply, WorkerError> {
        let mut state = self.lock();
        state.calls.push(WorkerCall::SetupContainerMonitors {
            id: container.id.clone(),
        });
        state.guard()?;
        Ok(MonitorReply {
            ok: true,
            monitor_count: 1,
            reason: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::{
        Accessor, AccessorId, ContainerRef, EndRequirement, MediaFileVersion, PackagePayload,
        StartRequirement, StatusReportSettings,
    };
    use std::collections::HashMap as StdHashMap;
    use tokio::sync::mpsc;

    fn folder_ref(id: &str, read: bool, write: bool) -> ContainerRef {
        let mut accessors = StdHashMap::new();
        accessors.insert(
            AccessorId::from("folder"),
            Accessor::LocalFolder {
                folder_path: format!("/{id}"),
                allow_read: read,
                allow_write: write,
            },
        );
        ContainerRef {
            container_id: crate::package::ContainerId::from(id),
            label: id.to_string(),
            accessors,
        }
    }

    fn media_expectation(id: &str) -> Expectation {
        Expectation {
            id: ExpectationId::from(id),
            priority: 0,
            status_report: StatusReportSettings::default(),
            package: PackagePayload::MediaFile {
                file_path: "a.mp4".to_string(),
                version: MediaFileVersion::default(),
            },
            content_version_hash: "h1".to_string(),
            start_requirement: StartRequirement {
                sources: vec![folder_ref("src", true, false)],
            },
            end_requirement: EndRequirement {
                targets: vec![folder_ref("dst", false, true)],
            },
            work_options: WorkOptions::default(),
            depends_on_fulfilled: vec![],
            trigger_by_fulfilled_ids: vec![],
        }
    }

    #[tokio::test]
    async fn supports_matching_accessors_by_default() {
        let worker = FakeWorker::new("w1");
        let reply = worker
            .supports_expectation(&media_expectation("e1"))
            .await
            .unwrap();
        assert!(reply.support);
    }

    #[tokio::test]
    async fn restricted_source_kinds_deny_support() {
        let worker = FakeWorker::new("w1");
        worker.set_supported_source_kinds([AccessorKind::Http]);

        let reply = worker
            .supports_expectation(&media_expectation("e1"))
            .await
            .unwrap();
        assert!(!reply.support);
    }

    #[tokio::test]
    async fn completing_a_job_pushes_done_and_marks_fulfilled() {
        let worker = FakeWorker::new("w1");
        let (tx, mut rx) = mpsc::unbounded_channel();
        worker.connect_job_channel(tx);

        let exp = media_expectation("e1");
        let wip = worker
            .work_on(&exp, &WorkOptions::default())
            .await
            .unwrap();
        worker.complete_job(&wip);

        let update = rx.try_recv().unwrap();
        assert_eq!(update.wip, wip);
        assert!(matches!(
            update.event,
            JobEventKind::Done { ref actual_version_hash } if actual_version_hash == "h1"
        ));

        let reply = worker.is_fulfilled(&exp, false).await.unwrap();
        assert!(reply.fulfilled);
        assert_eq!(reply.actual_version_hash.as_deref(), Some("h1"));
    }

    #[tokio::test]
    async fn transport_failure_fails_every_call() {
        let worker = FakeWorker::new("w1");
        worker.set_transport_failure(true);

        let result = worker.supports_expectation(&media_expectation("e1")).await;
        assert!(matches!(result, Err(WorkerError::Unreachable(_))));
    }

    #[tokio::test]
    async fn concurrency_limit_rejects_extra_work() {
        let worker = FakeWorker::new("w1");
        worker.set_concurrency_limit(1);

        let first = worker
            .work_on(&media_expectation("e1"), &WorkOptions::default())
            .await;
        assert!(first.is_ok());

        let second = worker
            .work_on(&media_expectation("e2"), &WorkOptions::default())
            .await;
        assert!(matches!(second, Err(WorkerError::Rejected(_))));
    }

    #[tokio::test]
    async fn calls_are_recorded() {
        let worker = FakeWorker::new("w1");
        let exp = media_expectation("e1");

        worker.supports_expectation(&exp).await.unwrap();
        worker.is_fulfilled(&exp, true).await.unwrap();

        let calls = worker.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(
            calls[1],
            WorkerCall::IsFulfilled {
                id: ExpectationId::from("e1"),
                was_fulfilled: true
            }
        );
    }
}
