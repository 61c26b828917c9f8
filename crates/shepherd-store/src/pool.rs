//! SQLite pool creation and schema management.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use tracing::info;

use crate::config::DbConfig;

/// Schema applied on startup. Statements are idempotent so reapplying on
/// every boot is safe.
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        namespace TEXT NOT NULL,
        generation INTEGER NOT NULL DEFAULT 1,
        resource_version INTEGER NOT NULL DEFAULT 1,
        repo_url TEXT NOT NULL,
        repo_ref TEXT NOT NULL,
        description TEXT NOT NULL,
        context BLOB NOT NULL DEFAULT x'',
        context_encoding TEXT NOT NULL DEFAULT 'plain',
        source_url TEXT,
        source_type TEXT,
        source_id TEXT,
        callback_url TEXT,
        sandbox_template TEXT NOT NULL,
        timeout_secs INTEGER,
        labels TEXT NOT NULL DEFAULT '{}',
        cancel_requested INTEGER NOT NULL DEFAULT 0,
        phase TEXT NOT NULL DEFAULT 'pending',
        conditions TEXT NOT NULL DEFAULT '[]',
        sandbox_claim_name TEXT,
        start_time TEXT,
        completion_time TEXT,
        grace_deadline TEXT,
        result_error TEXT,
        result_pr_url TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0,
        token_generation INTEGER,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_tasks_namespace_phase ON tasks(namespace, phase)",
    "CREATE TABLE IF NOT EXISTS sandbox_claims (
        name TEXT PRIMARY KEY,
        namespace TEXT NOT NULL,
        task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
        template TEXT NOT NULL,
        ready TEXT NOT NULL DEFAULT 'Unknown',
        reason TEXT,
        message TEXT,
        sandbox_name TEXT,
        service_fqdn TEXT,
        resource_version INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_claims_task ON sandbox_claims(task_id)",
    "CREATE TABLE IF NOT EXISTS leases (
        name TEXT PRIMARY KEY,
        holder TEXT NOT NULL,
        expires_at_ms INTEGER NOT NULL
    )",
];

/// Create a connection pool with sensible defaults.
///
/// Foreign keys are enabled so claim rows cascade-delete with their task.
pub async fn create_pool(config: &DbConfig) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&config.database_url)
        .with_context(|| format!("invalid database URL {}", config.database_url))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(30));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await
        .with_context(|| format!("failed to open database at {}", config.database_url))?;

    Ok(pool)
}

/// Create an in-memory pool for tests.
///
/// The pool is capped at one connection so the single in-memory database is
/// shared by every query.
pub async fn memory_pool() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(DbConfig::MEMORY_URL)
        .context("invalid in-memory database URL")?
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .context("failed to open in-memory database")?;

    Ok(pool)
}

/// Apply the embedded schema to the pool.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    for stmt in SCHEMA {
        sqlx::query(stmt)
            .execute(pool)
            .await
            .with_context(|| format!("failed to apply schema statement: {}", first_line(stmt)))?;
    }
    info!("schema applied");
    Ok(())
}

fn first_line(stmt: &str) -> &str {
    stmt.lines().next().unwrap_or(stmt).trim()
}
