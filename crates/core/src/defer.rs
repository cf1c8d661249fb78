// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Request coalescing for duplicate in-flight calls
//!
//! When a call with the same key is already in flight, join its result
//! instead of issuing a second call. Used for worker capability probes and
//! package container queries, where several evaluations can ask the same
//! worker the same question at nearly the same moment.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Coalesces same-key async calls into a single in-flight request
pub struct DeferGets<K, V> {
    inflight: Arc<Mutex<HashMap<K, broadcast::Sender<V>>>>,
}

impl<K, V> Default for DeferGets<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Clone for DeferGets<K, V> {
    fn clone(&self) -> Self {
        Self {
            inflight: Arc::clone(&self.inflight),
        }
    }
}

enum Role<V> {
    Leader,
    Joiner(broadcast::Receiver<V>),
}

impl<K, V> DeferGets<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run `call`, or join an in-flight call with the same key
    ///
    /// Exactly one caller per key becomes the leader and issues the real
    /// call; everyone else awaits the leader's result.
    pub async fn get_or_join<F, Fut>(&self, key: K, call: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let role = {
            let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            match inflight.get(&key) {
                Some(tx) => Role::Joiner(tx.subscribe()),
                None => {
                    let (tx, _) = broadcast::channel(1);
                    inflight.insert(key.clone(), tx);
                    Role::Leader
                }
            }
        };

        match role {
            Role::Joiner(mut rx) => match rx.recv().await {
                Ok(value) => value,
                // Leader vanished without sending; fall back to our own call
                Err(_) => call().await,
            },
            Role::Leader => {
                let value = call().await;
                let tx = {
                    self.inflight
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(&key)
                };
                if let Some(tx) = tx {
                    let _ = tx.send(value.clone());
                }
                value
            }
        }
    }

    /// Number of calls currently in flight
    pub fn inflight_count(&self) -> usize {
        self.inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}
