//! Token bucket.
//!
//! Capacity equals the rule quota and the bucket refills continuously at
//! `max_requests / window` tokens per millisecond, so short bursts are
//! absorbed while the long-run rate stays at the quota.

use super::{Decision, EvalContext};
use crate::metrics::ClientMetrics;

pub fn evaluate(metrics: &mut ClientMetrics, ctx: &EvalContext) -> Decision {
    let capacity = ctx.max_requests as f64;
    let window = ctx.window_ms.max(1);
    let refill_rate = capacity / window as f64; // tokens per ms

    if metrics.bucket.is_none() || metrics.last_request == 0 {
        metrics.bucket = Some(capacity);
        metrics.last_request = ctx.now_ms;
    } else {
        let elapsed = ctx.now_ms.saturating_sub(metrics.last_request);
        let refill = (elapsed as f64 * refill_rate).floor();
        if refill >= 1.0 {
            let level = metrics.bucket.unwrap_or(capacity);
            metrics.bucket = Some((level + refill).min(capacity));
            // Advance the stamp by the time those whole tokens represent so
            // fractional refill progress carries over to the next check.
            metrics.last_request += (refill / refill_rate) as u64;
        }
    }

    let level = metrics.bucket.unwrap_or(capacity);
    let allowed = level >= 1.0;
    let level = if allowed { level - 1.0 } else { level };
    metrics.bucket = Some(level);

    Decision {
        allowed,
        remaining: level.floor() as u32,
        reset_at_ms: ctx.now_ms + ((capacity - level) / refill_rate).ceil() as u64,
        total: ctx.max_requests,
    }
}
