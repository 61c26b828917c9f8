//! Query functions for the `tasks` table.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{Condition, ContextEncoding, NewTask, Task, TaskPhase};

use super::{fmt_opt_ts, fmt_ts, parse_opt_ts, parse_ts, parse_uuid};

/// Columns selected for every task fetch, in [`TaskRow`] order.
const TASK_COLUMNS: &str = "id, namespace, generation, resource_version, repo_url, repo_ref, \
     description, context, context_encoding, source_url, source_type, source_id, callback_url, \
     sandbox_template, timeout_secs, labels, cancel_requested, phase, conditions, \
     sandbox_claim_name, start_time, completion_time, grace_deadline, result_error, \
     result_pr_url, retry_count, token_generation, created_at";

/// Insert a new task in phase `pending` with an empty status.
pub async fn insert_task(pool: &SqlitePool, new: &NewTask) -> Result<Task, StoreError> {
    let task = Task {
        id: Uuid::new_v4(),
        namespace: new.namespace.clone(),
        generation: 1,
        resource_version: 1,
        repo_url: new.repo_url.clone(),
        repo_ref: new.repo_ref.clone(),
        description: new.description.clone(),
        context: new.context.clone(),
        context_encoding: new.context_encoding,
        source_url: new.source_url.clone(),
        source_type: new.source_type.clone(),
        source_id: new.source_id.clone(),
        callback_url: new.callback_url.clone(),
        sandbox_template: new.sandbox_template.clone(),
        timeout_secs: new.timeout_secs,
        labels: new.labels.clone(),
        cancel_requested: false,
        phase: TaskPhase::Pending,
        conditions: Vec::new(),
        sandbox_claim_name: None,
        start_time: None,
        completion_time: None,
        grace_deadline: None,
        result_error: None,
        result_pr_url: None,
        retry_count: 0,
        token_generation: None,
        created_at: Utc::now(),
    };

    sqlx::query(
        "INSERT INTO tasks (id, namespace, generation, resource_version, repo_url, repo_ref, \
         description, context, context_encoding, source_url, source_type, source_id, \
         callback_url, sandbox_template, timeout_secs, labels, cancel_requested, phase, \
         conditions, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(task.id.to_string())
    .bind(&task.namespace)
    .bind(task.generation)
    .bind(task.resource_version)
    .bind(&task.repo_url)
    .bind(&task.repo_ref)
    .bind(&task.description)
    .bind(&task.context)
    .bind(task.context_encoding.to_string())
    .bind(&task.source_url)
    .bind(&task.source_type)
    .bind(&task.source_id)
    .bind(&task.callback_url)
    .bind(&task.sandbox_template)
    .bind(task.timeout_secs)
    .bind(serde_json::to_string(&task.labels).unwrap_or_else(|_| "{}".to_string()))
    .bind(task.cancel_requested)
    .bind(task.phase.to_string())
    .bind("[]")
    .bind(fmt_ts(task.created_at))
    .execute(pool)
    .await?;

    Ok(task)
}

/// Fetch a single task by id.
pub async fn get_task(pool: &SqlitePool, id: Uuid) -> Result<Option<Task>, StoreError> {
    let row: Option<TaskRow> =
        sqlx::query_as(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(pool)
            .await?;

    row.map(Task::try_from).transpose()
}

/// List tasks in a namespace, optionally filtered by label equality and by
/// liveness (`active_only` keeps pending/running tasks).
///
/// Label matching uses SQLite's `json_extract` over the stored labels
/// object, so selectors hit the database rather than post-filtering.
pub async fn list_tasks(
    pool: &SqlitePool,
    namespace: &str,
    selector: &[(String, String)],
    active_only: bool,
) -> Result<Vec<Task>, StoreError> {
    let mut sql = format!(
        "SELECT {TASK_COLUMNS} FROM tasks WHERE namespace = ?"
    );
    for _ in selector {
        sql.push_str(" AND json_extract(labels, ?) = ?");
    }
    if active_only {
        sql.push_str(" AND phase IN ('pending', 'running')");
    }
    sql.push_str(" ORDER BY created_at ASC");

    let mut query = sqlx::query_as::<_, TaskRow>(&sql).bind(namespace);
    for (key, value) in selector {
        // Quote the key so label names with dots stay a single path segment.
        query = query.bind(format!("$.\"{key}\"")).bind(value);
    }

    let rows = query.fetch_all(pool).await?;
    rows.into_iter().map(Task::try_from).collect()
}

/// Write a task's status columns under optimistic concurrency.
///
/// The UPDATE only applies when the stored `resource_version` matches the
/// caller's copy; zero rows affected means either a conflict or a missing
/// task, disambiguated by a refetch. Returns the task with the bumped
/// version on success.
pub async fn update_task_status(pool: &SqlitePool, task: &Task) -> Result<Task, StoreError> {
    let conditions = serde_json::to_string(&task.conditions).map_err(|e| StoreError::Corrupt {
        kind: "task",
        id: task.id.to_string(),
        detail: format!("unencodable conditions: {e}"),
    })?;

    let result = sqlx::query(
        "UPDATE tasks SET phase = ?, conditions = ?, sandbox_claim_name = ?, start_time = ?, \
         completion_time = ?, grace_deadline = ?, result_error = ?, result_pr_url = ?, \
         retry_count = ?, resource_version = resource_version + 1 \
         WHERE id = ? AND resource_version = ?",
    )
    .bind(task.phase.to_string())
    .bind(conditions)
    .bind(&task.sandbox_claim_name)
    .bind(fmt_opt_ts(task.start_time))
    .bind(fmt_opt_ts(task.completion_time))
    .bind(fmt_opt_ts(task.grace_deadline))
    .bind(&task.result_error)
    .bind(&task.result_pr_url)
    .bind(task.retry_count)
    .bind(task.id.to_string())
    .bind(task.resource_version)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return match get_task(pool, task.id).await? {
            Some(_) => Err(StoreError::Conflict {
                kind: "task",
                id: task.id.to_string(),
            }),
            None => Err(StoreError::NotFound {
                kind: "task",
                id: task.id.to_string(),
            }),
        };
    }

    let mut updated = task.clone();
    updated.resource_version += 1;
    Ok(updated)
}

/// Set the spec-level cancel flag. Idempotent: cancelling an already
/// cancelled task succeeds without another generation bump.
pub async fn request_cancel(pool: &SqlitePool, id: Uuid) -> Result<Task, StoreError> {
    let result = sqlx::query(
        "UPDATE tasks SET cancel_requested = 1, generation = generation + 1, \
         resource_version = resource_version + 1 \
         WHERE id = ? AND cancel_requested = 0",
    )
    .bind(id.to_string())
    .execute(pool)
    .await?;

    let task = get_task(pool, id).await?.ok_or(StoreError::NotFound {
        kind: "task",
        id: id.to_string(),
    })?;

    if result.rows_affected() == 0 && !task.cancel_requested {
        // Should not happen: no row changed yet the flag is clear.
        return Err(StoreError::Conflict {
            kind: "task",
            id: id.to_string(),
        });
    }

    Ok(task)
}

/// Record that a VCS token was vended for the given generation.
///
/// At most one issue per generation: a second call for the same generation
/// fails with [`StoreError::Conflict`].
pub async fn claim_token_generation(
    pool: &SqlitePool,
    id: Uuid,
    generation: i64,
) -> Result<(), StoreError> {
    let result = sqlx::query(
        "UPDATE tasks SET token_generation = ?, resource_version = resource_version + 1 \
         WHERE id = ? AND generation = ? \
         AND (token_generation IS NULL OR token_generation < ?)",
    )
    .bind(generation)
    .bind(id.to_string())
    .bind(generation)
    .bind(generation)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return match get_task(pool, id).await? {
            Some(_) => Err(StoreError::Conflict {
                kind: "task token",
                id: id.to_string(),
            }),
            None => Err(StoreError::NotFound {
                kind: "task",
                id: id.to_string(),
            }),
        };
    }

    Ok(())
}

/// Delete a task. Claims owned by the task cascade-delete with it.
pub async fn delete_task(pool: &SqlitePool, id: Uuid) -> Result<(), StoreError> {
    let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
        .bind(id.to_string())
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound {
            kind: "task",
            id: id.to_string(),
        });
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    namespace: String,
    generation: i64,
    resource_version: i64,
    repo_url: String,
    repo_ref: String,
    description: String,
    context: Vec<u8>,
    context_encoding: String,
    source_url: Option<String>,
    source_type: Option<String>,
    source_id: Option<String>,
    callback_url: Option<String>,
    sandbox_template: String,
    timeout_secs: Option<i64>,
    labels: String,
    cancel_requested: bool,
    phase: String,
    conditions: String,
    sandbox_claim_name: Option<String>,
    start_time: Option<String>,
    completion_time: Option<String>,
    grace_deadline: Option<String>,
    result_error: Option<String>,
    result_pr_url: Option<String>,
    retry_count: i64,
    token_generation: Option<i64>,
    created_at: String,
}

impl TryFrom<TaskRow> for Task {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let corrupt = |detail: String| StoreError::Corrupt {
            kind: "task",
            id: row.id.clone(),
            detail,
        };

        let labels: BTreeMap<String, String> =
            serde_json::from_str(&row.labels).map_err(|e| corrupt(format!("bad labels: {e}")))?;
        let conditions: Vec<Condition> = serde_json::from_str(&row.conditions)
            .map_err(|e| corrupt(format!("bad conditions: {e}")))?;
        let phase = TaskPhase::from_str(&row.phase).map_err(|e| corrupt(e.to_string()))?;
        let context_encoding =
            ContextEncoding::from_str(&row.context_encoding).map_err(|e| corrupt(e.to_string()))?;

        Ok(Task {
            id: parse_uuid("task", &row.id)?,
            namespace: row.namespace,
            generation: row.generation,
            resource_version: row.resource_version,
            repo_url: row.repo_url,
            repo_ref: row.repo_ref,
            description: row.description,
            context: row.context,
            context_encoding,
            source_url: row.source_url,
            source_type: row.source_type,
            source_id: row.source_id,
            callback_url: row.callback_url,
            sandbox_template: row.sandbox_template,
            timeout_secs: row.timeout_secs,
            labels,
            cancel_requested: row.cancel_requested,
            phase,
            conditions,
            sandbox_claim_name: row.sandbox_claim_name,
            start_time: parse_opt_ts("task", &row.id, row.start_time)?,
            completion_time: parse_opt_ts("task", &row.id, row.completion_time)?,
            grace_deadline: parse_opt_ts("task", &row.id, row.grace_deadline)?,
            result_error: row.result_error,
            result_pr_url: row.result_pr_url,
            retry_count: row.retry_count,
            token_generation: row.token_generation,
            created_at: parse_ts("task", &row.id, &row.created_at)?,
        })
    }
}
