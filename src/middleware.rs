//! Request middleware: evaluate the matched rule, then deny, queue, or
//! forward. Internal failures fail open with a logged warning; the limiter
//! is never allowed to be the cause of an outage.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use tracing::{info, warn};

use crate::limiter::RateLimitEngine;
use crate::response;
use crate::throttle::{PriorityPolicy, ThrottleConfig};

pub async fn rate_limit_middleware(
    State(engine): State<Arc<RateLimitEngine>>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let outcome = match engine.check(&path, request.headers()) {
        Ok(outcome) => outcome,
        Err(error) => {
            // Fail open: the limiter is never allowed to take the service
            // down with it.
            warn!(
                target: "floodgate::middleware",
                path = %path,
                error = %error,
                "limiter evaluation failed, admitting request"
            );
            return next.run(request).await;
        }
    };

    let Some(outcome) = outcome else {
        // No rule matched: pass through unchanged.
        return next.run(request).await;
    };

    if !outcome.decision.allowed {
        info!(
            target: "floodgate::middleware",
            client_key = %outcome.key,
            path = %path,
            rule_id = %outcome.rule_id,
            "rate limit exceeded"
        );
        return response::rate_limited(
            &outcome.decision,
            outcome.message.as_deref(),
            engine.now_ms(),
            outcome.headers,
        );
    }

    let throttle_cfg = ThrottleConfig::for_path(&path);
    let _permit = if throttle_cfg.enabled {
        let priority = PriorityPolicy::Standard.score(request.headers());
        match engine
            .throttle()
            .acquire(&outcome.key, &throttle_cfg, priority, engine.now_ms())
            .await
        {
            Ok(permit) => Some(permit),
            Err(rejection) => {
                engine.record_blocked(&outcome.key);
                info!(
                    target: "floodgate::middleware",
                    client_key = %outcome.key,
                    path = %path,
                    rejection = ?rejection,
                    "request throttled"
                );
                return response::throttled();
            }
        }
    } else {
        None
    };

    // The permit is held across the downstream call and released when this
    // scope unwinds, whatever happens inside the handler.
    let mut response = next.run(request).await;
    let status = response.status();

    engine.record_outcome(&outcome.key, status.is_server_error());

    let skip = (outcome.skip_successful && status.is_success())
        || (outcome.skip_failed && status.as_u16() >= 400);
    if skip {
        engine.uncount(&outcome.key, outcome.strategy, outcome.decision.total);
    }

    if outcome.headers {
        response::decorate(&mut response, &outcome.decision);
    }
    response
}
