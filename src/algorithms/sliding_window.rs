//! Sliding window approximation.
//!
//! Instead of a timestamped request log, the count decays exponentially
//! with elapsed time, trading exactness for O(1) memory per client.

use super::{Decision, EvalContext};
use crate::metrics::ClientMetrics;

pub fn evaluate(metrics: &mut ClientMetrics, ctx: &EvalContext) -> Decision {
    evaluate_with_limit(metrics, ctx, ctx.max_requests)
}

/// Core evaluation with an explicit limit; the adaptive strategy substitutes
/// its computed effective limit here.
pub(crate) fn evaluate_with_limit(
    metrics: &mut ClientMetrics,
    ctx: &EvalContext,
    limit: u32,
) -> Decision {
    let window = ctx.window_ms.max(1) as f64;
    let elapsed = ctx.now_ms.saturating_sub(metrics.last_request) as f64;

    if metrics.last_request == 0 || elapsed > window {
        metrics.requests = 0.0;
    } else {
        metrics.requests *= 1.0 - elapsed / window;
    }
    // The decayed value is relative to now; without this stamp the next call
    // would decay the same interval twice.
    metrics.last_request = ctx.now_ms;

    let allowed = metrics.requests < limit as f64;
    if allowed {
        metrics.requests += 1.0;
    }

    Decision {
        allowed,
        remaining: (limit as f64 - metrics.requests).max(0.0).floor() as u32,
        reset_at_ms: ctx.now_ms + ctx.window_ms,
        total: limit,
    }
}
