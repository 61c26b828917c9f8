//! Shared test utilities for shepherd integration tests.
//!
//! Each test gets its own in-memory SQLite database with the schema
//! applied, so tests are fully isolated and need no external services.

use std::collections::BTreeMap;

use shepherd_store::models::{ContextEncoding, NewTask};
use shepherd_store::{TaskStore, pool};

/// Create a fresh in-memory store with the schema applied.
pub async fn memory_store() -> TaskStore {
    let pool = pool::memory_pool().await.expect("in-memory pool");
    pool::run_migrations(&pool).await.expect("schema");
    TaskStore::new(pool)
}

/// A minimal valid task spec for tests.
pub fn new_task(namespace: &str) -> NewTask {
    NewTask {
        namespace: namespace.to_string(),
        repo_url: "https://github.com/org/repo".to_string(),
        repo_ref: "main".to_string(),
        description: "fix the flaky widget test".to_string(),
        context: Vec::new(),
        context_encoding: ContextEncoding::Plain,
        source_url: Some("https://github.com/org/repo/issues/7".to_string()),
        source_type: Some("issue".to_string()),
        source_id: Some("7".to_string()),
        callback_url: None,
        sandbox_template: "default".to_string(),
        timeout_secs: None,
        labels: BTreeMap::new(),
    }
}

/// A task spec labelled for (repo, issue) lookups.
pub fn new_labelled_task(namespace: &str, repo: &str, issue: &str) -> NewTask {
    let mut task = new_task(namespace);
    task.labels.insert("repo".to_string(), repo.to_string());
    task.labels.insert("issue".to_string(), issue.to_string());
    task
}
