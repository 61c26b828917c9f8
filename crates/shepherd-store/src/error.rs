//! Store error taxonomy.
//!
//! Callers match on these to decide between retry (Conflict), 404 at the
//! API boundary (NotFound), and everything else.

/// Errors surfaced by store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested object does not exist.
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// An optimistic write lost the race: the stored resource version no
    /// longer matches the caller's copy. Refetch and retry.
    #[error("conflict writing {kind} {id}: stale resource version")]
    Conflict { kind: &'static str, id: String },

    /// A stored row could not be decoded into its domain type.
    #[error("corrupt {kind} row {id}: {detail}")]
    Corrupt {
        kind: &'static str,
        id: String,
        detail: String,
    },

    /// Underlying database failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// True when the error is an optimistic-concurrency conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// True when the error is a missing object.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
