//! Internal surface: the runner protocol and the provisioner contract.

use std::str::FromStr;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use shepherd_core::completion::TerminalOutcome;
use shepherd_core::context;
use shepherd_core::events::TaskEvent;
use shepherd_core::recorder::{self, EventKind};
use shepherd_core::token::VcsToken;
use shepherd_store::models::{ConditionStatus, SandboxClaim, Task};

use super::AppState;
use super::error::ApiError;

// ---------------------------------------------------------------------------
// Task data
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct TaskDataResponse {
    pub description: String,
    pub context: String,
    #[serde(rename = "sourceURL", skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    pub repo: RepoResponse,
}

#[derive(Debug, Serialize)]
pub struct RepoResponse {
    pub url: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
}

/// GET /tasks/{id}/data -- what the runner needs to start working.
pub async fn task_data(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TaskDataResponse>, ApiError> {
    let task = fetch_live(&state, id).await?;

    let raw = context::decode(&task.context, task.context_encoding)
        .map_err(ApiError::internal)?;

    Ok(Json(TaskDataResponse {
        description: task.description,
        context: String::from_utf8_lossy(&raw).into_owned(),
        source_url: task.source_url,
        repo: RepoResponse {
            url: task.repo_url,
            git_ref: task.repo_ref,
        },
    }))
}

// ---------------------------------------------------------------------------
// Token vending
// ---------------------------------------------------------------------------

/// GET /tasks/{id}/token -- a repo-scoped VCS token, at most once per task
/// generation. The second call for the same generation answers 409; an
/// unconfigured issuer answers 503.
pub async fn task_token(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<VcsToken>, ApiError> {
    let task = fetch_live(&state, id).await?;

    // Mint before claiming the slot: a failed exchange must not burn the
    // generation's one issue.
    let token = state.issuer.issue(&task.repo_url).await?;

    state
        .store
        .claim_token_generation(task.id, task.generation)
        .await
        .map_err(|e| {
            if e.is_conflict() {
                ApiError::conflict(format!(
                    "token already issued for task {id} generation {}",
                    task.generation
                ))
            } else {
                e.into()
            }
        })?;

    Ok(Json(token))
}

// ---------------------------------------------------------------------------
// Status reports
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct StatusReport {
    pub event: ReportEvent,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub details: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportEvent {
    Started,
    Completed,
    Failed,
}

/// POST /tasks/{id}/status -- the sole runner-initiated path into a
/// terminal state. Idempotent: reports against an already-terminal task
/// return 200 without mutating anything.
pub async fn report_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(report): Json<StatusReport>,
) -> Result<Json<Task>, ApiError> {
    // 404 before anything else; terminal tasks are fine here.
    let task = state.store.get(id).await?;

    let outcome = match report.event {
        ReportEvent::Started => {
            recorder::record(
                id,
                EventKind::Normal,
                "RunnerStarted",
                report.message.as_deref().unwrap_or("runner started"),
            );
            return Ok(Json(task));
        }
        ReportEvent::Completed => {
            let pr_url = report.details["prURL"].as_str().map(str::to_owned);
            TerminalOutcome::succeeded(
                report
                    .message
                    .unwrap_or_else(|| "runner reported completion".to_string()),
                pr_url,
                report.details,
            )
        }
        ReportEvent::Failed => TerminalOutcome::failed(
            report
                .message
                .unwrap_or_else(|| "runner reported failure".to_string()),
            report.details,
        ),
    };

    let task = state.completion.complete(id, outcome).await?;
    Ok(Json(task))
}

// ---------------------------------------------------------------------------
// Event append
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct AppendResponse {
    pub accepted: usize,
    pub dropped: usize,
}

/// POST /tasks/{id}/events -- batched activity append. Duplicate sequences
/// drop silently; appends against a terminal task answer 410.
pub async fn append_events(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(batch): Json<Vec<TaskEvent>>,
) -> Result<Json<AppendResponse>, ApiError> {
    let task = fetch_live(&state, id).await?;

    let stats = state.events.append(task.id, batch);
    Ok(Json(AppendResponse {
        accepted: stats.accepted,
        dropped: stats.dropped,
    }))
}

// ---------------------------------------------------------------------------
// Provisioner contract
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ClaimsQuery {
    #[serde(default)]
    pub namespace: Option<String>,
}

/// GET /claims -- claims awaiting fulfillment.
pub async fn list_pending_claims(
    State(state): State<AppState>,
    Query(query): Query<ClaimsQuery>,
) -> Result<Json<Vec<SandboxClaim>>, ApiError> {
    let namespace = query.namespace.unwrap_or_else(|| state.namespace.clone());
    let claims = state.store.pending_claims(&namespace).await?;
    Ok(Json(claims))
}

#[derive(Debug, Deserialize)]
pub struct ClaimStatusUpdate {
    pub ready: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, rename = "sandboxName")]
    pub sandbox_name: Option<String>,
    #[serde(default, rename = "serviceFQDN")]
    pub service_fqdn: Option<String>,
}

/// PUT /claims/{name}/status -- the provisioner publishes the Ready
/// condition and, when fulfilled, the sandbox name and service address.
pub async fn update_claim_status(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(update): Json<ClaimStatusUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    let ready = ConditionStatus::from_str(&update.ready)
        .map_err(|e| ApiError::bad_request(e.to_string()))?;

    let claim = state
        .store
        .update_claim_status(
            &name,
            ready,
            update.reason.as_deref(),
            update.message.as_deref(),
            update.sandbox_name.as_deref(),
            update.service_fqdn.as_deref(),
        )
        .await?;

    Ok(Json(claim))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Fetch a task that must still be live: 404 when unknown, 410 once
/// terminal.
async fn fetch_live(state: &AppState, id: Uuid) -> Result<Task, ApiError> {
    let task = state.store.get(id).await?;
    if task.is_terminal() {
        return Err(ApiError::gone(format!("task {id} is finished")));
    }
    Ok(task)
}
