//! Fixed window counter.
//!
//! Cheap and deterministic. A burst straddling a window boundary can see up
//! to twice the quota; that approximation is accepted in exchange for O(1)
//! state per client.

use super::{Decision, EvalContext};
use crate::metrics::ClientMetrics;

pub fn evaluate(metrics: &mut ClientMetrics, ctx: &EvalContext) -> Decision {
    let window = ctx.window_ms.max(1);
    let boundary = ctx.now_ms / window * window;

    // Last counted event predates this window: start the count over.
    if metrics.last_request < boundary {
        metrics.requests = 0.0;
    }

    let allowed = (metrics.requests as u32) < ctx.max_requests;
    if allowed {
        metrics.requests += 1.0;
        metrics.last_request = ctx.now_ms;
    }

    Decision {
        allowed,
        remaining: ctx.max_requests.saturating_sub(metrics.requests as u32),
        reset_at_ms: boundary + window,
        total: ctx.max_requests,
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_ctx;
    use super::*;

    #[test]
    fn admits_quota_then_denies() {
        let mut m = ClientMetrics::default();
        let now = 1_000_000;
        for i in 0..3 {
            let d = evaluate(&mut m, &test_ctx(1_000, 3, now + i));
            assert!(d.allowed, "request {i} should be admitted");
        }
        let denied = evaluate(&mut m, &test_ctx(1_000, 3, now + 10));
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.reset_at_ms, 1_001_000);
    }

    #[test]
    fn denial_does_not_consume_quota() {
        let mut m = ClientMetrics::default();
        let now = 1_000_000;
        for _ in 0..3 {
            evaluate(&mut m, &test_ctx(1_000, 3, now));
        }
        for _ in 0..5 {
            evaluate(&mut m, &test_ctx(1_000, 3, now + 1));
        }
        assert_eq!(m.requests, 3.0);
    }

    #[test]
    fn count_resets_at_window_boundary() {
        let mut m = ClientMetrics::default();
        for _ in 0..3 {
            evaluate(&mut m, &test_ctx(1_000, 3, 1_000_500));
        }
        assert!(!evaluate(&mut m, &test_ctx(1_000, 3, 1_000_900)).allowed);

        // New window: count starts from zero again.
        let d = evaluate(&mut m, &test_ctx(1_000, 3, 1_001_100));
        assert!(d.allowed);
        assert_eq!(d.remaining, 2);
    }
}
