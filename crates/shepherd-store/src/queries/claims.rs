//! Query functions for the `sandbox_claims` table.
//!
//! A claim is owned by exactly one task (foreign key, cascade delete); its
//! status side is written through [`update_claim_status`] by the
//! provisioner surface.

use std::str::FromStr;

use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{ConditionStatus, SandboxClaim};

use super::{fmt_ts, parse_ts, parse_uuid};

const CLAIM_COLUMNS: &str = "name, namespace, task_id, template, ready, reason, message, \
     sandbox_name, service_fqdn, resource_version, created_at";

/// Insert a new claim for a task.
pub async fn insert_claim(
    pool: &SqlitePool,
    name: &str,
    namespace: &str,
    task_id: Uuid,
    template: &str,
) -> Result<SandboxClaim, StoreError> {
    let claim = SandboxClaim {
        name: name.to_owned(),
        namespace: namespace.to_owned(),
        task_id,
        template: template.to_owned(),
        ready: ConditionStatus::Unknown,
        reason: None,
        message: None,
        sandbox_name: None,
        service_fqdn: None,
        resource_version: 1,
        created_at: Utc::now(),
    };

    sqlx::query(
        "INSERT INTO sandbox_claims (name, namespace, task_id, template, ready, created_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&claim.name)
    .bind(&claim.namespace)
    .bind(claim.task_id.to_string())
    .bind(&claim.template)
    .bind(claim.ready.to_string())
    .bind(fmt_ts(claim.created_at))
    .execute(pool)
    .await?;

    Ok(claim)
}

/// Fetch a claim by name.
pub async fn get_claim(pool: &SqlitePool, name: &str) -> Result<Option<SandboxClaim>, StoreError> {
    let row: Option<ClaimRow> = sqlx::query_as(&format!(
        "SELECT {CLAIM_COLUMNS} FROM sandbox_claims WHERE name = ?"
    ))
    .bind(name)
    .fetch_optional(pool)
    .await?;

    row.map(SandboxClaim::try_from).transpose()
}

/// Fetch the claim owned by a task, if any.
pub async fn get_claim_for_task(
    pool: &SqlitePool,
    task_id: Uuid,
) -> Result<Option<SandboxClaim>, StoreError> {
    let row: Option<ClaimRow> = sqlx::query_as(&format!(
        "SELECT {CLAIM_COLUMNS} FROM sandbox_claims WHERE task_id = ?"
    ))
    .bind(task_id.to_string())
    .fetch_optional(pool)
    .await?;

    row.map(SandboxClaim::try_from).transpose()
}

/// List claims the provisioner has not fulfilled yet.
pub async fn list_pending_claims(
    pool: &SqlitePool,
    namespace: &str,
) -> Result<Vec<SandboxClaim>, StoreError> {
    let rows: Vec<ClaimRow> = sqlx::query_as(&format!(
        "SELECT {CLAIM_COLUMNS} FROM sandbox_claims \
         WHERE namespace = ? AND ready = 'Unknown' ORDER BY created_at ASC"
    ))
    .bind(namespace)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(SandboxClaim::try_from).collect()
}

/// Publish claim status: the Ready condition plus the concrete sandbox
/// name and service address once fulfilled.
pub async fn update_claim_status(
    pool: &SqlitePool,
    name: &str,
    ready: ConditionStatus,
    reason: Option<&str>,
    message: Option<&str>,
    sandbox_name: Option<&str>,
    service_fqdn: Option<&str>,
) -> Result<SandboxClaim, StoreError> {
    let result = sqlx::query(
        "UPDATE sandbox_claims SET ready = ?, reason = ?, message = ?, \
         sandbox_name = COALESCE(?, sandbox_name), \
         service_fqdn = COALESCE(?, service_fqdn), \
         resource_version = resource_version + 1 \
         WHERE name = ?",
    )
    .bind(ready.to_string())
    .bind(reason)
    .bind(message)
    .bind(sandbox_name)
    .bind(service_fqdn)
    .bind(name)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound {
            kind: "sandbox claim",
            id: name.to_owned(),
        });
    }

    get_claim(pool, name).await?.ok_or(StoreError::NotFound {
        kind: "sandbox claim",
        id: name.to_owned(),
    })
}

/// Delete a claim by name. Deleting an absent claim is not an error; the
/// reconciler calls this on every pass over a terminal task.
pub async fn delete_claim(pool: &SqlitePool, name: &str) -> Result<bool, StoreError> {
    let result = sqlx::query("DELETE FROM sandbox_claims WHERE name = ?")
        .bind(name)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// Count claims owned by a task.
pub async fn count_claims_for_task(pool: &SqlitePool, task_id: Uuid) -> Result<i64, StoreError> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sandbox_claims WHERE task_id = ?")
        .bind(task_id.to_string())
        .fetch_one(pool)
        .await?;

    Ok(row.0)
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct ClaimRow {
    name: String,
    namespace: String,
    task_id: String,
    template: String,
    ready: String,
    reason: Option<String>,
    message: Option<String>,
    sandbox_name: Option<String>,
    service_fqdn: Option<String>,
    resource_version: i64,
    created_at: String,
}

impl TryFrom<ClaimRow> for SandboxClaim {
    type Error = StoreError;

    fn try_from(row: ClaimRow) -> Result<Self, Self::Error> {
        let ready = ConditionStatus::from_str(&row.ready).map_err(|e| StoreError::Corrupt {
            kind: "sandbox claim",
            id: row.name.clone(),
            detail: e.to_string(),
        })?;

        Ok(SandboxClaim {
            namespace: row.namespace,
            task_id: parse_uuid("sandbox claim", &row.task_id)?,
            template: row.template,
            ready,
            reason: row.reason,
            message: row.message,
            sandbox_name: row.sandbox_name,
            service_fqdn: row.service_fqdn,
            resource_version: row.resource_version,
            created_at: parse_ts("sandbox claim", &row.name, &row.created_at)?,
            name: row.name,
        })
    }
}
