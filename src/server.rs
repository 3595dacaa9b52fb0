//! Router assembly and server lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::response::IntoResponse;
use axum::routing::{any, delete, get, post, put};
use axum::{middleware, Json, Router};
use serde_json::json;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::handlers;
use crate::limiter::RateLimitEngine;
use crate::middleware::rate_limit_middleware;

/// Build the application router: health endpoints, the admin surface, and
/// the limited `/api` tree wrapping the downstream handler.
pub fn create_app(engine: Arc<RateLimitEngine>) -> Router {
    let admin = Router::new()
        .route("/stats", get(handlers::get_stats))
        .route("/clients", get(handlers::list_clients))
        .route("/clients/:key", get(handlers::get_client))
        .route("/clients/:key/reset", post(handlers::reset_client))
        .route("/rules", get(handlers::list_rules).post(handlers::add_rule))
        .route("/rules/:id", delete(handlers::delete_rule))
        .route("/adaptive", put(handlers::update_adaptive));

    // Stand-in for the protected downstream service; the limiter treats it
    // as an opaque next handler.
    let api = Router::new()
        .route("/api/*path", any(passthrough))
        .route("/api", any(passthrough))
        .layer(middleware::from_fn_with_state(
            engine.clone(),
            rate_limit_middleware,
        ));

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .nest("/admin", admin)
        .merge(api)
        .with_state(engine)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

async fn passthrough() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

pub struct Server {
    app: Router,
    bind_addr: SocketAddr,
}

impl Server {
    pub fn new(config: &Config, engine: Arc<RateLimitEngine>) -> Self {
        engine.spawn_sweeper(config.cleanup_interval);
        Self {
            app: create_app(engine),
            bind_addr: config.bind_addr,
        }
    }

    pub async fn run(self) -> std::io::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;

        tracing::info!("floodgate listening on {}", self.bind_addr);
        tracing::info!("Health check available at /health");
        tracing::info!("Admin surface available under /admin");

        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
