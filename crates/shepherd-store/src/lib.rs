//! Durable task store for shepherd.
//!
//! Holds the declarative record of every task (spec, status, conditions,
//! generation) plus the sandbox claims owned by tasks and the leader lease.
//! All writes go through optimistic concurrency: a stale resource version
//! fails with [`error::StoreError::Conflict`] and the caller refetches.

pub mod config;
pub mod error;
pub mod models;
pub mod pool;
pub mod queries;
pub mod store;

pub use error::StoreError;
pub use store::{TaskChange, TaskStore};
