//! Health and admin HTTP handlers.
//!
//! The admin surface mirrors the engine's operational API: rule
//! registration and removal, per-client metrics, system stats, client
//! resets, and adaptive settings updates. These routes sit outside the
//! rate-limiting layer.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::algorithms::AdaptiveSettingsUpdate;
use crate::error::EngineError;
use crate::limiter::RateLimitEngine;
use crate::rules::RuleSpec;

type Engine = State<Arc<RateLimitEngine>>;

pub async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn readiness_check(State(engine): Engine) -> impl IntoResponse {
    let stats = engine.system_stats();
    Json(json!({
        "status": "ready",
        "rules": stats.total_rules,
    }))
}

pub async fn get_stats(State(engine): Engine) -> impl IntoResponse {
    Json(engine.system_stats())
}

pub async fn list_clients(State(engine): Engine) -> impl IntoResponse {
    Json(engine.all_client_metrics())
}

pub async fn get_client(
    State(engine): Engine,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    engine
        .get_client_metrics(&key)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

pub async fn reset_client(State(engine): Engine, Path(key): Path<String>) -> impl IntoResponse {
    let reset = engine.reset_client(&key);
    Json(json!({ "key": key, "reset": reset }))
}

pub async fn list_rules(State(engine): Engine) -> impl IntoResponse {
    Json(engine.list_rules())
}

pub async fn add_rule(
    State(engine): Engine,
    Json(spec): Json<RuleSpec>,
) -> Result<impl IntoResponse, EngineError> {
    let id = spec.id.clone();
    engine.add_rule_spec(spec)?;
    Ok((StatusCode::CREATED, Json(json!({ "id": id, "status": "registered" }))))
}

pub async fn delete_rule(
    State(engine): Engine,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    if engine.remove_rule(&id) {
        Ok(Json(json!({ "id": id, "status": "removed" })))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

pub async fn update_adaptive(
    State(engine): Engine,
    Json(update): Json<AdaptiveSettingsUpdate>,
) -> impl IntoResponse {
    Json(engine.update_adaptive_settings(&update))
}
