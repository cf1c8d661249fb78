// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The authoritative in-memory table of tracked expectations
//!
//! Upstream sends the full desired set; the store diffs it against what is
//! tracked. New ids are inserted, changed definitions are restarted, and
//! missing ids are marked removed. Definition changes are detected with a
//! canonical structural hash so key order in the upstream payload is
//! irrelevant.

use super::tracked::{ExpectationState, TrackedExpectation};
use crate::clock::Clock;
use crate::hash;
use crate::package::{Expectation, ExpectationId};
use crate::reason::Reason;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// One effect of an ingest diff
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestChange {
    Inserted { id: ExpectationId },
    Restarted { id: ExpectationId },
    Removed { id: ExpectationId },
}

/// Table of tracked expectations keyed by id
#[derive(Default)]
pub struct ExpectationStore {
    items: HashMap<ExpectationId, TrackedExpectation>,
}

impl ExpectationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the desired set, diffing against the tracked table
    pub fn ingest(
        &mut self,
        expectations: Vec<Expectation>,
        clock: &impl Clock,
    ) -> Vec<IngestChange> {
        let mut changes = Vec::new();
        let incoming: HashSet<ExpectationId> =
            expectations.iter().map(|e| e.id.clone()).collect();

        for exp in expectations {
            let def_hash = match hash::hash_of(&exp) {
                Ok(hash) => hash,
                Err(err) => {
                    tracing::warn!(expectation = %exp.id, error = %err, "unhashable definition");
                    String::new()
                }
            };

            match self.items.get_mut(&exp.id) {
                None => {
                    let id = exp.id.clone();
                    self.items
                        .insert(id.clone(), TrackedExpectation::new(exp, def_hash, clock));
                    changes.push(IngestChange::Inserted { id });
                }
                Some(tracked) => {
                    let reappeared = tracked.state == ExpectationState::Removed;
                    if tracked.def_hash != def_hash || reappeared {
                        let id = exp.id.clone();
                        tracked.exp = Arc::new(exp);
                        tracked.def_hash = def_hash;
                        tracked.state = ExpectationState::Restarted;
                        tracked.reason = if reappeared {
                            Reason::user_only("Expectation reappeared upstream")
                        } else {
                            Reason::user_only("Expectation definition changed")
                        };
                        tracked.is_error = false;
                        tracked.dirty = true;
                        tracked.next_evaluation = None;
                        changes.push(IngestChange::Restarted { id });
                    }
                }
            }
        }

        for (id, tracked) in self.items.iter_mut() {
            if incoming.contains(id) {
                continue;
            }
            if tracked.state != ExpectationState::Removed {
                tracked.state = ExpectationState::Removed;
                tracked.reason = Reason::user_only("No longer expected upstream");
                tracked.is_error = false;
                tracked.dirty = true;
                tracked.next_evaluation = None;
                changes.push(IngestChange::Removed { id: id.clone() });
            }
        }

        changes
    }

    pub fn get(&self, id: &ExpectationId) -> Option<&TrackedExpectation> {
        self.items.get(id)
    }

    pub fn get_mut(&mut self, id: &ExpectationId) -> Option<&mut TrackedExpectation> {
        self.items.get_mut(id)
    }

    pub fn remove(&mut self, id: &ExpectationId) -> Option<TrackedExpectation> {
        self.items.remove(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackedExpectation> {
        self.items.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut TrackedExpectation> {
        self.items.values_mut()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Force re-evaluation of an expectation on the next tick
    pub fn mark_dirty(&mut self, id: &ExpectationId) -> bool {
        match self.items.get_mut(id) {
            Some(tracked) => {
                tracked.dirty = true;
                true
            }
            None => false,
        }
    }

    pub fn any_dirty(&self) -> bool {
        self.items.values().any(|t| t.dirty)
    }

    /// Evaluation order: priority ascending, then cheapest state class
    /// (fulfilled first), then id for determinism
    pub fn snapshot(&self) -> Vec<ExpectationId> {
        let mut ids: Vec<&TrackedExpectation> = self.items.values().collect();
        ids.sort_by(|a, b| {
            a.priority()
                .cmp(&b.priority())
                .then(a.state.eval_class().cmp(&b.state.eval_class()))
                .then(a.id().cmp(b.id()))
        });
        ids.into_iter().map(|t| t.id().clone()).collect()
    }

    pub fn is_fulfilled(&self, id: &ExpectationId) -> bool {
        self.items
            .get(id)
            .map(|t| t.state == ExpectationState::Fulfilled)
            .unwrap_or(false)
    }

    /// First dependency that is not fulfilled, if any. An unknown
    /// dependency id counts as unmet.
    pub fn first_unmet_dependency<'a>(&self, exp: &'a Expectation) -> Option<&'a ExpectationId> {
        exp.depends_on_fulfilled
            .iter()
            .find(|dep| !self.is_fulfilled(dep))
    }

    /// Expectations that should wake up when `id` becomes fulfilled:
    /// explicit triggers plus everything depending on it
    pub fn dependents_of(&self, id: &ExpectationId) -> Vec<ExpectationId> {
        self.items
            .values()
            .filter(|t| {
                t.exp.trigger_by_fulfilled_ids.contains(id)
                    || t.exp.depends_on_fulfilled.contains(id)
            })
            .map(|t| t.id().clone())
            .collect()
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
