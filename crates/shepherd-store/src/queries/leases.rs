//! Leader lease queries.
//!
//! A single row per lease name. Acquisition succeeds when the lease is
//! free, expired, or already held by the caller; renewal is acquisition by
//! the current holder. Expiry is compared in integer unix milliseconds so
//! the takeover check runs inside one UPDATE.

use std::time::Duration;

use chrono::Utc;
use sqlx::SqlitePool;

use crate::error::StoreError;

/// Try to acquire (or renew) the named lease for `holder` with the given
/// time-to-live. Returns true when this holder now owns the lease.
pub async fn acquire_lease(
    pool: &SqlitePool,
    name: &str,
    holder: &str,
    ttl: Duration,
) -> Result<bool, StoreError> {
    let now_ms = Utc::now().timestamp_millis();
    let expires_ms = now_ms + ttl.as_millis() as i64;

    // Upsert wins when the row is absent; the WHERE arm of the conflict
    // clause wins when the lease is ours or has lapsed.
    let result = sqlx::query(
        "INSERT INTO leases (name, holder, expires_at_ms) VALUES (?, ?, ?) \
         ON CONFLICT(name) DO UPDATE SET holder = excluded.holder, \
         expires_at_ms = excluded.expires_at_ms \
         WHERE leases.holder = excluded.holder OR leases.expires_at_ms < ?",
    )
    .bind(name)
    .bind(holder)
    .bind(expires_ms)
    .bind(now_ms)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Release the lease if held by `holder`.
pub async fn release_lease(pool: &SqlitePool, name: &str, holder: &str) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM leases WHERE name = ? AND holder = ?")
        .bind(name)
        .bind(holder)
        .execute(pool)
        .await?;
    Ok(())
}

/// Current holder of an unexpired lease, if any.
pub async fn lease_holder(pool: &SqlitePool, name: &str) -> Result<Option<String>, StoreError> {
    let now_ms = Utc::now().timestamp_millis();
    let row: Option<(String,)> =
        sqlx::query_as("SELECT holder FROM leases WHERE name = ? AND expires_at_ms >= ?")
            .bind(name)
            .bind(now_ms)
            .fetch_optional(pool)
            .await?;
    Ok(row.map(|(h,)| h))
}
