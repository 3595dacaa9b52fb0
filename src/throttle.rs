//! Per-key concurrency caps with a priority queue of waiting requests.
//!
//! Queued entries hold oneshot continuations and are granted slots in
//! priority order. A grant carries the admission permit itself, so a grant
//! nobody collects frees its slot when the channel drops. Grants are sent
//! while the queue lock is held, so a waiter whose entry is gone can trust
//! `try_recv` to resolve the race with its own timeout.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::identity;

/// Concurrency limits for one class of paths. Derived from the request path
/// alone, independent of which rate-limit rule matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleConfig {
    pub enabled: bool,
    /// In-flight cap per client key.
    pub max_concurrent: usize,
    /// Maximum pending entries across all clients.
    pub queue_size: usize,
    /// Longest a queued entry may wait before rejection.
    pub timeout: Duration,
}

impl ThrottleConfig {
    pub const DISABLED: ThrottleConfig = ThrottleConfig {
        enabled: false,
        max_concurrent: 0,
        queue_size: 0,
        timeout: Duration::from_secs(0),
    };

    pub fn for_path(path: &str) -> ThrottleConfig {
        if path.contains("/upload") {
            ThrottleConfig {
                enabled: true,
                max_concurrent: 2,
                queue_size: 10,
                timeout: Duration::from_secs(10),
            }
        } else if path.contains("/search") {
            ThrottleConfig {
                enabled: true,
                max_concurrent: 5,
                queue_size: 20,
                timeout: Duration::from_secs(5),
            }
        } else {
            Self::DISABLED
        }
    }
}

/// Closed set of priority scorers; higher scores are served first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityPolicy {
    /// Authenticated callers ahead of anonymous ones.
    #[default]
    Standard,
    /// Everyone equal; pure FIFO.
    Uniform,
}

impl PriorityPolicy {
    pub fn score(&self, headers: &HeaderMap) -> i32 {
        match self {
            PriorityPolicy::Standard => {
                if identity::is_authenticated(headers) {
                    5
                } else {
                    1
                }
            }
            PriorityPolicy::Uniform => 1,
        }
    }
}

/// Why an admission attempt did not get a slot. Both map to a 503; neither
/// is an error in the engine's taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleRejection {
    QueueFull,
    TimedOut,
    /// The entry was discarded before a grant arrived (e.g. by the cleanup
    /// sweeper).
    Cancelled,
}

struct QueueEntry {
    id: Uuid,
    key: String,
    priority: i32,
    enqueued_at: u64,
    /// The entry's own config travels with it; re-evaluation after a failed
    /// slot check uses this, never some process-wide default.
    max_concurrent: usize,
    grant: oneshot::Sender<ThrottlePermit>,
}

#[derive(Default)]
struct Inner {
    in_flight: DashMap<String, usize>,
    pending: Mutex<VecDeque<QueueEntry>>,
}

/// Cheaply cloneable handle; clones share one queue and one set of
/// in-flight counters.
#[derive(Clone, Default)]
pub struct ThrottleController {
    inner: Arc<Inner>,
}

impl fmt::Debug for ThrottleController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThrottleController").finish_non_exhaustive()
    }
}

impl ThrottleController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit the caller immediately, queue it, or reject it.
    ///
    /// `now_ms` stamps the enqueue time for aging; the wait itself is
    /// bounded by `cfg.timeout` on the runtime clock.
    pub async fn acquire(
        &self,
        key: &str,
        cfg: &ThrottleConfig,
        priority: i32,
        now_ms: u64,
    ) -> Result<ThrottlePermit, ThrottleRejection> {
        debug_assert!(cfg.enabled);

        if self.try_reserve(key, cfg.max_concurrent) {
            return Ok(self.permit(key));
        }

        let id = Uuid::new_v4();
        let mut rx = {
            let mut pending = self.inner.pending.lock();
            if pending.len() >= cfg.queue_size {
                return Err(ThrottleRejection::QueueFull);
            }
            let (tx, rx) = oneshot::channel();
            let entry = QueueEntry {
                id,
                key: key.to_string(),
                priority,
                enqueued_at: now_ms,
                max_concurrent: cfg.max_concurrent,
                grant: tx,
            };
            // Higher priority first; FIFO within a priority level.
            let position = pending
                .iter()
                .position(|e| e.priority < priority)
                .unwrap_or(pending.len());
            pending.insert(position, entry);
            rx
        };

        // A slot may have freed between the failed reservation and the
        // enqueue; pump once so the entry cannot strand on a free slot.
        self.pump();

        let sleep = tokio::time::sleep(cfg.timeout);
        tokio::pin!(sleep);
        tokio::select! {
            granted = &mut rx => match granted {
                Ok(permit) => Ok(permit),
                Err(_) => Err(ThrottleRejection::Cancelled),
            },
            _ = &mut sleep => {
                if self.remove_entry(id) {
                    debug!(client_key = %key, "queued admission timed out");
                    Err(ThrottleRejection::TimedOut)
                } else {
                    // Entry already popped: the grant either landed before
                    // the timeout fired or the sweeper dropped us.
                    match rx.try_recv() {
                        Ok(permit) => Ok(permit),
                        Err(_) => Err(ThrottleRejection::Cancelled),
                    }
                }
            }
        }
    }

    fn permit(&self, key: &str) -> ThrottlePermit {
        ThrottlePermit {
            controller: self.clone(),
            key: key.to_string(),
        }
    }

    /// Reserve a slot if the key is below its cap.
    fn try_reserve(&self, key: &str, max_concurrent: usize) -> bool {
        let mut count = self.inner.in_flight.entry(key.to_string()).or_insert(0);
        if *count < max_concurrent {
            *count += 1;
            true
        } else {
            false
        }
    }

    /// Grant slots to every queued entry whose key has room, in priority
    /// order. Sends happen under the queue lock (see module docs).
    fn pump(&self) {
        let mut orphaned = Vec::new();
        {
            let mut pending = self.inner.pending.lock();
            let mut i = 0;
            while i < pending.len() {
                let admit = {
                    let entry = &pending[i];
                    let current = self.inner.in_flight.get(&entry.key).map(|c| *c).unwrap_or(0);
                    current < entry.max_concurrent
                };
                if !admit {
                    i += 1;
                    continue;
                }
                let entry = match pending.remove(i) {
                    Some(entry) => entry,
                    None => break,
                };
                *self.inner.in_flight.entry(entry.key.clone()).or_insert(0) += 1;
                let permit = self.permit(&entry.key);
                if let Err(permit) = entry.grant.send(permit) {
                    // Waiter vanished before delivery. The returned permit
                    // must be dropped outside the lock: its Drop re-enters
                    // the pump to hand the slot onward.
                    orphaned.push(permit);
                }
            }
        }
        drop(orphaned);
    }

    fn remove_entry(&self, id: Uuid) -> bool {
        let mut pending = self.inner.pending.lock();
        if let Some(position) = pending.iter().position(|e| e.id == id) {
            pending.remove(position);
            true
        } else {
            false
        }
    }

    fn release_slot(&self, key: &str) {
        let mut empty = false;
        if let Some(mut count) = self.inner.in_flight.get_mut(key) {
            *count = count.saturating_sub(1);
            empty = *count == 0;
        }
        if empty {
            self.inner.in_flight.remove_if(key, |_, count| *count == 0);
        }
    }

    /// Drop queued entries older than `max_age_ms`. Dropping the sender
    /// rejects the waiter through its normal cancellation path, so a missed
    /// timeout callback cannot leave an entry behind forever.
    pub fn sweep_queue(&self, now_ms: u64, max_age_ms: u64) -> usize {
        let mut pending = self.inner.pending.lock();
        let before = pending.len();
        pending.retain(|e| now_ms.saturating_sub(e.enqueued_at) < max_age_ms);
        before - pending.len()
    }

    pub fn queue_len(&self) -> usize {
        self.inner.pending.lock().len()
    }

    pub fn in_flight_count(&self, key: &str) -> usize {
        self.inner.in_flight.get(key).map(|c| *c).unwrap_or(0)
    }

    #[cfg(test)]
    fn queued_priorities(&self) -> Vec<i32> {
        self.inner.pending.lock().iter().map(|e| e.priority).collect()
    }
}

/// RAII admission token: holding one means the request occupies a
/// concurrency slot. Dropping it releases the slot and wakes the queue, on
/// every exit path including cancellation.
#[derive(Debug)]
pub struct ThrottlePermit {
    controller: ThrottleController,
    key: String,
}

impl Drop for ThrottlePermit {
    fn drop(&mut self) {
        self.controller.release_slot(&self.key);
        self.controller.pump();
    }
}
