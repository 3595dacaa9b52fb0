//! Per-client metrics store and reputation tracking.
//!
//! One [`ClientMetrics`] entry exists per client key, created lazily on the
//! first observed request and evicted by the cleanup sweeper after a period
//! of inactivity. Entries are mutated only by the strategy evaluators and
//! the reputation methods here.

use dashmap::DashMap;
use serde::Serialize;

pub const REPUTATION_INITIAL: f64 = 50.0;
pub const REPUTATION_MIN: f64 = 0.0;
pub const REPUTATION_MAX: f64 = 100.0;

/// Slow-moving adjustments; reputation reflects sustained behavior, not
/// single events.
const REP_DELTA_ALLOW: f64 = 0.5;
const REP_DELTA_VIOLATION: f64 = 2.0;
const REP_DELTA_SERVER_ERROR: f64 = 1.0;
const REP_DELTA_OK_OUTCOME: f64 = 0.1;

#[derive(Debug, Clone, Serialize)]
pub struct ClientMetrics {
    /// Request count within the active window. Fractional under the
    /// sliding-window decay.
    pub requests: f64,
    /// Timestamp (ms) of the last counted event.
    pub last_request: u64,
    /// Token-bucket level; populated on first use of that strategy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<f64>,
    /// Lifetime count of rate-limit denials.
    pub violations: u64,
    /// Lifetime count of throttle rejections.
    pub blocked: u64,
    /// 0-100, starts at 50, clamped at both ends.
    pub reputation: f64,
}

impl Default for ClientMetrics {
    fn default() -> Self {
        Self {
            requests: 0.0,
            last_request: 0,
            bucket: None,
            violations: 0,
            blocked: 0,
            reputation: REPUTATION_INITIAL,
        }
    }
}

impl ClientMetrics {
    pub fn note_allowed(&mut self) {
        self.reputation = (self.reputation + REP_DELTA_ALLOW).min(REPUTATION_MAX);
    }

    pub fn note_violation(&mut self) {
        self.violations += 1;
        self.reputation = (self.reputation - REP_DELTA_VIOLATION).max(REPUTATION_MIN);
    }

    pub fn note_blocked(&mut self) {
        self.blocked += 1;
    }

    pub fn note_outcome(&mut self, server_error: bool) {
        if server_error {
            self.reputation = (self.reputation - REP_DELTA_SERVER_ERROR).max(REPUTATION_MIN);
        } else {
            self.reputation = (self.reputation + REP_DELTA_OK_OUTCOME).min(REPUTATION_MAX);
        }
    }
}

/// A named snapshot, used by the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct ClientSnapshot {
    pub key: String,
    #[serde(flatten)]
    pub metrics: ClientMetrics,
}

/// Concurrent map of client key to metrics. DashMap gives per-entry
/// exclusive access, so concurrent requests for the same key serialize on
/// that entry alone.
#[derive(Debug, Default)]
pub struct MetricsStore {
    clients: DashMap<String, ClientMetrics>,
}

impl MetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` against the entry for `key`, creating it if absent.
    pub fn with_entry<T>(&self, key: &str, f: impl FnOnce(&mut ClientMetrics) -> T) -> T {
        let mut entry = self.clients.entry(key.to_string()).or_default();
        f(entry.value_mut())
    }

    pub fn snapshot(&self, key: &str) -> Option<ClientMetrics> {
        self.clients.get(key).map(|entry| entry.value().clone())
    }

    pub fn snapshot_all(&self) -> Vec<ClientSnapshot> {
        self.clients
            .iter()
            .map(|entry| ClientSnapshot {
                key: entry.key().clone(),
                metrics: entry.value().clone(),
            })
            .collect()
    }

    pub fn reset(&self, key: &str) -> bool {
        self.clients.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn record_outcome(&self, key: &str, server_error: bool) {
        self.with_entry(key, |m| m.note_outcome(server_error));
    }

    pub fn record_blocked(&self, key: &str) {
        self.with_entry(key, |m| m.note_blocked());
    }

    /// Evict entries whose last counted event is older than `max_idle_ms`.
    /// Returns the number of evictions; calling again with no new traffic
    /// evicts nothing further.
    pub fn evict_idle(&self, now_ms: u64, max_idle_ms: u64) -> usize {
        let before = self.clients.len();
        self.clients
            .retain(|_, m| now_ms.saturating_sub(m.last_request) < max_idle_ms);
        before - self.clients.len()
    }

    /// One pass over the map producing the adaptive strategy's cross-client
    /// inputs: how many clients were active within `horizon_ms`, and their
    /// aggregate in-window request volume.
    pub fn load_sample(&self, now_ms: u64, horizon_ms: u64) -> (usize, f64) {
        let mut active = 0usize;
        let mut volume = 0.0f64;
        for entry in self.clients.iter() {
            if now_ms.saturating_sub(entry.last_request) <= horizon_ms {
                active += 1;
                volume += entry.requests;
            }
        }
        (active, volume)
    }
}
