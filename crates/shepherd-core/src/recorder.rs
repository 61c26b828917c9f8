//! Structured transition events.
//!
//! Every task state transition is recorded as a structured log line with a
//! severity, a short machine-readable reason, and a human message. This is
//! the audit trail for the lifecycle engine; nothing else persists it.

use uuid::Uuid;

/// Severity of a recorded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Normal,
    Warning,
}

/// Record a transition event on a task.
pub fn record(task_id: Uuid, kind: EventKind, reason: &str, message: &str) {
    match kind {
        EventKind::Normal => {
            tracing::info!(task_id = %task_id, reason, message, "task event");
        }
        EventKind::Warning => {
            tracing::warn!(task_id = %task_id, reason, message, "task event");
        }
    }
}
