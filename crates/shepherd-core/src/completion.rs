//! The terminal-transition pipeline.
//!
//! Both runner status reports (through the API) and reconciler decisions
//! (timeout, grace expiry, retry exhaustion, cancellation) finish tasks
//! through this one path, so the write is optimistic-concurrency safe, the
//! side effects fire exactly once per transition, and a second completion
//! of an already-terminal task is a harmless no-op.

use serde_json::Value;
use uuid::Uuid;

use shepherd_store::models::{ConditionStatus, Task, TaskPhase};
use shepherd_store::{StoreError, TaskStore};

use crate::callback::{CallbackDelivery, CallbackDispatcher, CallbackEvent, CallbackPayload};
use crate::events::{EventLog, TaskCompletion};
use crate::recorder::{self, EventKind};

/// Bounded refetch-and-retry on optimistic conflicts.
const UPDATE_ATTEMPTS: usize = 4;

/// Which terminal state a task is entering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalKind {
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

/// A requested terminal transition.
#[derive(Debug, Clone)]
pub struct TerminalOutcome {
    pub kind: TerminalKind,
    pub message: String,
    pub pr_url: Option<String>,
    pub details: Value,
}

impl TerminalOutcome {
    pub fn succeeded(message: impl Into<String>, pr_url: Option<String>, details: Value) -> Self {
        Self {
            kind: TerminalKind::Succeeded,
            message: message.into(),
            pr_url,
            details,
        }
    }

    pub fn failed(message: impl Into<String>, details: Value) -> Self {
        Self {
            kind: TerminalKind::Failed,
            message: message.into(),
            pr_url: None,
            details,
        }
    }

    pub fn timed_out(message: impl Into<String>) -> Self {
        Self {
            kind: TerminalKind::TimedOut,
            message: message.into(),
            pr_url: None,
            details: Value::Null,
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            kind: TerminalKind::Cancelled,
            message: message.into(),
            pr_url: None,
            details: Value::Null,
        }
    }

    fn phase(&self) -> TaskPhase {
        match self.kind {
            TerminalKind::Succeeded => TaskPhase::Succeeded,
            TerminalKind::Failed => TaskPhase::Failed,
            TerminalKind::TimedOut => TaskPhase::TimedOut,
            TerminalKind::Cancelled => TaskPhase::Cancelled,
        }
    }

    fn condition_status(&self) -> ConditionStatus {
        match self.kind {
            TerminalKind::Succeeded => ConditionStatus::True,
            _ => ConditionStatus::False,
        }
    }

    fn reason(&self) -> &'static str {
        match self.kind {
            TerminalKind::Succeeded => "Completed",
            TerminalKind::Failed => "Failed",
            TerminalKind::TimedOut => "TimedOut",
            TerminalKind::Cancelled => "Cancelled",
        }
    }

    fn callback_event(&self) -> CallbackEvent {
        match self.kind {
            TerminalKind::Succeeded => CallbackEvent::Completed,
            _ => CallbackEvent::Failed,
        }
    }
}

/// Errors from completing a task.
#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("task {0} not found")]
    NotFound(Uuid),

    #[error("task {0} update kept conflicting; giving up")]
    Contended(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Shared sink for terminal transitions.
#[derive(Clone)]
pub struct CompletionPipeline {
    store: TaskStore,
    events: std::sync::Arc<EventLog>,
    callbacks: CallbackDispatcher,
}

impl CompletionPipeline {
    pub fn new(
        store: TaskStore,
        events: std::sync::Arc<EventLog>,
        callbacks: CallbackDispatcher,
    ) -> Self {
        Self {
            store,
            events,
            callbacks,
        }
    }

    /// Drive a task into the requested terminal state.
    ///
    /// Idempotent: a task that is already terminal is returned unchanged
    /// and no side effect fires, whatever outcome was requested. Terminal
    /// is absorbing. On optimistic conflicts the write refetches and
    /// retries a bounded number of times.
    pub async fn complete(
        &self,
        task_id: Uuid,
        outcome: TerminalOutcome,
    ) -> Result<Task, CompletionError> {
        for _ in 0..UPDATE_ATTEMPTS {
            let mut task = match self.store.try_get(task_id).await? {
                Some(task) => task,
                None => return Err(CompletionError::NotFound(task_id)),
            };

            if task.is_terminal() {
                return Ok(task);
            }

            task.phase = outcome.phase();
            task.set_succeeded_condition(
                outcome.condition_status(),
                outcome.reason(),
                &outcome.message,
            );
            if task.completion_time.is_none() {
                task.completion_time = Some(chrono::Utc::now());
            }
            task.grace_deadline = None;
            match outcome.kind {
                TerminalKind::Succeeded => {
                    task.result_pr_url = outcome.pr_url.clone();
                    task.result_error = None;
                }
                _ => {
                    task.result_error = Some(outcome.message.clone());
                }
            }

            match self.store.update_status(&task).await {
                Ok(updated) => {
                    self.fan_out(&updated, &outcome);
                    return Ok(updated);
                }
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(CompletionError::Contended(task_id))
    }

    /// Post-write side effects: transition event, stream sentinel, callback.
    fn fan_out(&self, task: &Task, outcome: &TerminalOutcome) {
        let kind = match outcome.kind {
            TerminalKind::Succeeded => EventKind::Normal,
            _ => EventKind::Warning,
        };
        recorder::record(task.id, kind, outcome.reason(), &outcome.message);

        self.events.complete(TaskCompletion {
            task_id: task.id,
            status: task.phase,
            pr_url: task.result_pr_url.clone(),
            error: task.result_error.clone(),
        });

        if let Some(url) = &task.callback_url {
            self.callbacks.enqueue(CallbackDelivery {
                url: url.clone(),
                payload: CallbackPayload {
                    task_id: task.id,
                    event: outcome.callback_event(),
                    message: outcome.message.clone(),
                    details: outcome.details.clone(),
                },
            });
        }
    }
}
