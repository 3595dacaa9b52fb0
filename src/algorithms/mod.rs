//! Rate limiting strategy evaluators.
//!
//! Four interchangeable algorithms, all pure with respect to time: the
//! caller injects `now_ms`, so every evaluator is testable without real
//! delays. Each consumes a client's metrics entry plus the matched rule's
//! window and quota, and yields an allow/deny [`Decision`].

pub mod adaptive;
pub mod fixed_window;
pub mod sliding_window;
pub mod token_bucket;

pub use adaptive::{AdaptiveSettings, AdaptiveSettingsUpdate};

use serde::{Deserialize, Serialize};

use crate::metrics::ClientMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    FixedWindow,
    SlidingWindow,
    TokenBucket,
    Adaptive,
}

/// Outcome of one evaluation.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Decision {
    pub allowed: bool,
    /// Whole requests left in the current window (floored).
    pub remaining: u32,
    /// When the quota is expected back at full, ms since epoch.
    pub reset_at_ms: u64,
    /// The limit the decision was made against. For the adaptive strategy
    /// this is the computed effective limit, not the configured base.
    pub total: u32,
}

/// Inputs shared by every evaluator.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext {
    pub window_ms: u64,
    pub max_requests: u32,
    pub now_ms: u64,
}

/// Cross-client inputs consumed only by the adaptive strategy.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadSignal {
    pub active_clients: usize,
    pub recent_volume: f64,
}

pub fn evaluate(
    strategy: Strategy,
    metrics: &mut ClientMetrics,
    ctx: &EvalContext,
    settings: &AdaptiveSettings,
    load: LoadSignal,
) -> Decision {
    match strategy {
        Strategy::FixedWindow => fixed_window::evaluate(metrics, ctx),
        Strategy::SlidingWindow => sliding_window::evaluate(metrics, ctx),
        Strategy::TokenBucket => token_bucket::evaluate(metrics, ctx),
        Strategy::Adaptive => adaptive::evaluate(metrics, ctx, settings, load),
    }
}

#[cfg(test)]
pub(crate) fn test_ctx(window_ms: u64, max_requests: u32, now_ms: u64) -> EvalContext {
    EvalContext {
        window_ms,
        max_requests,
        now_ms,
    }
}
