//! Battle arena daemon.
//!
//! Serves the test-run lifecycle over HTTP and runs the periodic
//! reconciliation sweep. Callback routes used by the executor and
//! evaluator are guarded by the shared webhook secret.

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod sweep;

use std::sync::Arc;
use std::time::Duration;

use arena_core::Arena;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

pub use config::Config;

pub struct AppState {
    pub arena: Arena,
    /// Required in `x-webhook-secret` on callback routes when set.
    pub webhook_secret: Option<String>,
    /// Default staleness cutoff for sweeps.
    pub stale_after: Duration,
}

impl AppState {
    pub fn new(arena: Arena, config: &Config) -> Self {
        Self {
            arena,
            webhook_secret: config.webhook.secret.clone(),
            stale_after: config.stale_after,
        }
    }
}

/// Routes called back by the executor and evaluator.
fn callback_router(middleware_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/test-runs/:id/status", post(handlers::report_status))
        .route("/test-runs/:id/heartbeat", post(handlers::heartbeat))
        .route(
            "/evaluations/:id/result",
            post(handlers::record_evaluation_result),
        )
        .route_layer(middleware::from_fn_with_state(
            middleware_state,
            auth::require_webhook_secret,
        ))
}

/// Build the full application router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/test-runs", post(handlers::create_run))
        .route("/test-runs/reconcile-stale", post(handlers::reconcile_stale))
        .route("/test-runs/:id", get(handlers::get_run))
        .route("/test-runs/:id/abort", post(handlers::abort_run))
        .route("/test-runs/:id/continue", post(handlers::continue_run))
        .route("/test-runs/:id/reconcile", post(handlers::reconcile_run))
        .route(
            "/test-runs/:id/evaluations",
            post(handlers::request_evaluation).get(handlers::list_evaluations),
        )
        .route(
            "/evaluations/:id/promote",
            post(handlers::promote_evaluation),
        )
        .route("/personas", post(handlers::register_persona))
        .route("/personas/:id", get(handlers::get_persona))
        .route(
            "/personas/:id/validation",
            post(handlers::validate_persona),
        )
        .merge(callback_router(state.clone()))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
