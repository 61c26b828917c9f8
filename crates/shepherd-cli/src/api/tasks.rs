//! Public task endpoints: create, query, fetch, cancel.

use std::collections::BTreeMap;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;
use uuid::Uuid;

use shepherd_core::context;
use shepherd_store::models::{NewTask, Task};

use super::AppState;
use super::error::ApiError;

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub repo: RepoSpec,
    pub task: TaskSpec,
    #[serde(default)]
    pub callback: Option<CallbackSpec>,
    #[serde(default)]
    pub runner: Option<RunnerSpec>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct RepoSpec {
    pub url: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
}

#[derive(Debug, Deserialize)]
pub struct TaskSpec {
    pub description: String,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default, rename = "sourceURL")]
    pub source_url: Option<String>,
    #[serde(default, rename = "sourceType")]
    pub source_type: Option<String>,
    #[serde(default, rename = "sourceID")]
    pub source_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackSpec {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct RunnerSpec {
    #[serde(default, rename = "sandboxTemplate")]
    pub sandbox_template: Option<String>,
    #[serde(default, rename = "timeoutSecs")]
    pub timeout_secs: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub issue: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST /tasks
pub async fn create_task(
    State(state): State<AppState>,
    Json(request): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if request.repo.url.trim().is_empty() {
        return Err(ApiError::bad_request("repo.url is required"));
    }
    if request.repo.git_ref.trim().is_empty() {
        return Err(ApiError::bad_request("repo.ref is required"));
    }
    if request.task.description.trim().is_empty() {
        return Err(ApiError::bad_request("task.description is required"));
    }

    let raw_context = request.task.context.unwrap_or_default();
    let (stored, encoding) = context::encode(raw_context.as_bytes());

    let runner = request.runner.unwrap_or(RunnerSpec {
        sandbox_template: None,
        timeout_secs: None,
    });

    let new = NewTask {
        namespace: state.namespace.clone(),
        repo_url: request.repo.url,
        repo_ref: request.repo.git_ref,
        description: request.task.description,
        context: stored,
        context_encoding: encoding,
        source_url: request.task.source_url,
        source_type: request.task.source_type,
        source_id: request.task.source_id,
        callback_url: request.callback.map(|c| c.url),
        sandbox_template: runner
            .sandbox_template
            .unwrap_or_else(|| "default".to_string()),
        timeout_secs: Some(
            runner
                .timeout_secs
                .filter(|&t| t > 0)
                .unwrap_or(state.default_timeout_secs),
        ),
        labels: request.labels,
    };

    let task = state.store.create(&new).await?;
    tracing::info!(task_id = %task.id, repo = %task.repo_url, "task created");
    Ok((StatusCode::CREATED, Json(task)))
}

/// GET /tasks?repo=…&issue=…&active=true
pub async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Task>>, ApiError> {
    let mut selector = Vec::new();
    if let Some(repo) = query.repo {
        selector.push(("repo".to_string(), repo));
    }
    if let Some(issue) = query.issue {
        selector.push(("issue".to_string(), issue));
    }

    let tasks = state
        .store
        .list(&state.namespace, &selector, query.active.unwrap_or(false))
        .await?;
    Ok(Json(tasks))
}

/// GET /tasks/{id}
pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Task>, ApiError> {
    let task = state.store.get(id).await?;
    Ok(Json(task))
}

/// POST /tasks/{id}/cancel
pub async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Task>, ApiError> {
    let task = state.store.request_cancel(id).await?;
    tracing::info!(task_id = %id, "cancellation requested");
    Ok(Json(task))
}

/// DELETE /tasks/{id} -- drop the record after audit. Claims cascade in
/// the store; the event log entry goes with it.
pub async fn delete_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.store.delete(id).await?;
    state.events.remove(id);
    tracing::info!(task_id = %id, "task deleted");
    Ok(StatusCode::NO_CONTENT)
}
