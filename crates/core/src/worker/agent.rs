// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The manager's view of one connected worker

use super::{WorkerApi, WorkerCapabilities, WorkerId};
use crate::clock::Clock;
use crate::package::ExpectationId;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A connected worker as tracked by the expectation manager
#[derive(Clone)]
pub struct WorkerAgent {
    pub id: WorkerId,
    pub api: Arc<dyn WorkerApi>,
    pub capabilities: WorkerCapabilities,
    pub connected: bool,
    pub last_seen: Instant,
    /// Expectations currently holding a slot on this worker
    pub assignments: HashSet<ExpectationId>,
}

impl WorkerAgent {
    pub fn new(api: Arc<dyn WorkerApi>, clock: &impl Clock) -> Self {
        let id = api.id();
        let capabilities = api.capabilities();
        Self {
            id,
            api,
            capabilities,
            connected: true,
            last_seen: clock.now(),
            assignments: HashSet::new(),
        }
    }

    /// Record that the worker was heard from
    pub fn note_seen(&mut self, now: Instant) {
        self.last_seen = now;
        self.connected = true;
    }

    /// Whether the worker can take one more assignment
    pub fn has_capacity(&self) -> bool {
        self.connected && self.assignments.len() < self.capabilities.concurrency_limit
    }

    pub fn assign(&mut self, id: ExpectationId) {
        self.assignments.insert(id);
    }

    pub fn release(&mut self, id: &ExpectationId) {
        self.assignments.remove(id);
    }

    /// Whether the heartbeat gap exceeds the given timeout
    pub fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        now.duration_since(self.last_seen) > timeout
    }
}

impl std::fmt::Debug for WorkerAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerAgent")
            .field("id", &self.id)
            .field("connected", &self.connected)
            .field("assignments", &self.assignments)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::worker::FakeWorker;

    fn make_agent(clock: &FakeClock) -> WorkerAgent {
        let worker = FakeWorker::new("w1");
        worker.set_concurrency_limit(2);
        WorkerAgent::new(Arc::new(worker), clock)
    }

    #[test]
    fn capacity_respects_concurrency_limit() {
        let clock = FakeClock::new();
        let mut agent = make_agent(&clock);

        assert!(agent.has_capacity());
        agent.assign(ExpectationId::from("e1"));
        assert!(agent.has_capacity());
        agent.assign(ExpectationId::from("e2"));
        assert!(!agent.has_capacity());

        agent.release(&ExpectationId::from("e1"));
        assert!(agent.has_capacity());
    }

    #[test]
    fn disconnected_worker_has_no_capacity() {
        let clock = FakeClock::new();
        let mut agent = make_agent(&clock);
        agent.connected = false;
        assert!(!agent.has_capacity());
    }

    #[test]
    fn staleness_follows_last_seen() {
        let clock = FakeClock::new();
        let mut agent = make_agent(&clock);
        let timeout = Duration::from_secs(15);

        clock.advance(Duration::from_secs(10));
        assert!(!agent.is_stale(clock.now(), timeout));

        clock.advance(Duration::from_secs(10));
        assert!(agent.is_stale(clock.now(), timeout));

        agent.note_seen(clock.now());
        assert!(!agent.is_stale(clock.now(), timeout));
    }
}
