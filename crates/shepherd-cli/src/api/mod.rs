//! HTTP surfaces.
//!
//! Three routers over one shared state: the public surface (task
//! lifecycle, queries, observer stream), the internal surface (runner
//! protocol plus the provisioner's claim-status contract), and a health
//! probe. Handlers stay thin; the lifecycle logic lives in
//! `shepherd-core`.

pub mod error;
pub mod runner;
pub mod stream;
pub mod tasks;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post, put};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use shepherd_core::completion::CompletionPipeline;
use shepherd_core::events::EventLog;
use shepherd_core::token::TokenIssuer;
use shepherd_store::TaskStore;

/// State shared by all handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: TaskStore,
    pub events: Arc<EventLog>,
    pub completion: CompletionPipeline,
    pub issuer: Arc<dyn TokenIssuer>,
    pub namespace: String,
    pub default_timeout_secs: i64,
}

/// Public surface: task creation, queries, cancellation, observer stream.
pub fn public_router(state: AppState) -> Router {
    Router::new()
        .route("/tasks", post(tasks::create_task).get(tasks::list_tasks))
        .route(
            "/tasks/{id}",
            get(tasks::get_task).delete(tasks::delete_task),
        )
        .route("/tasks/{id}/cancel", post(tasks::cancel_task))
        .route("/tasks/{id}/events", get(stream::stream_events))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Internal surface: runner protocol plus provisioner claim status.
pub fn internal_router(state: AppState) -> Router {
    Router::new()
        .route("/tasks/{id}/data", get(runner::task_data))
        .route("/tasks/{id}/token", get(runner::task_token))
        .route("/tasks/{id}/status", post(runner::report_status))
        .route("/tasks/{id}/events", post(runner::append_events))
        .route("/claims", get(runner::list_pending_claims))
        .route("/claims/{name}/status", put(runner::update_claim_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Liveness probe.
pub fn health_router() -> Router {
    Router::new().route("/healthz", get(healthz))
}

async fn healthz() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({ "status": "ok" }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
