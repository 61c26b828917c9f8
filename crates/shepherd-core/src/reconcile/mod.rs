//! Level-triggered task reconciliation.
//!
//! One pass observes a task's current state and takes the single next
//! action toward its goal: create a sandbox claim, assign the runner, arm
//! the timeout, open a grace window, reincarnate infrastructure, or finish
//! the task. Every intermediate state is recoverable by re-entering the
//! function, so crashes between steps only cost a retry.

pub mod controller;
pub mod workqueue;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use shepherd_store::models::{ConditionStatus, SandboxClaim, Task, TaskPhase, claim_reasons};
use shepherd_store::{StoreError, TaskStore};

use crate::assign::{AssignError, AssignmentClient, AssignmentRequest};
use crate::completion::{CompletionError, CompletionPipeline, TerminalOutcome};
use crate::recorder::{self, EventKind};

/// Requeue while waiting for an optimistic-conflict refetch or the first
/// pass after creation.
const SHORT_REQUEUE: Duration = Duration::from_secs(1);

/// Requeue while waiting for the provisioner to fulfill a claim.
const CLAIM_WAIT_REQUEUE: Duration = Duration::from_secs(5);

/// What to do after a successful reconcile pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Action {
    pub requeue_after: Option<Duration>,
}

impl Action {
    /// Nothing further to do until an external event re-triggers the task.
    pub fn done() -> Self {
        Self {
            requeue_after: None,
        }
    }

    /// Revisit the task after `delay`.
    pub fn requeue(delay: Duration) -> Self {
        Self {
            requeue_after: Some(delay),
        }
    }
}

/// Reconcile failures. Transient ones requeue with backoff in the
/// controller; nothing here is surfaced to users.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Completion(#[from] CompletionError),

    #[error("transient: {0}")]
    Transient(String),
}

/// Reconciler tuning.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Namespace this reconciler owns.
    pub namespace: String,
    /// API base URL handed to runners at assignment.
    pub api_url: String,
    /// Sandbox reincarnations before giving up on infrastructure.
    pub max_infra_retries: i64,
    /// Grace window after a Running task's sandbox goes not-ready.
    pub grace_duration: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            api_url: "http://127.0.0.1:8081".to_string(),
            max_infra_retries: 3,
            grace_duration: Duration::from_secs(30),
        }
    }
}

/// Drives tasks from Pending to a terminal state.
pub struct Reconciler {
    store: TaskStore,
    assigner: Arc<dyn AssignmentClient>,
    completion: CompletionPipeline,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        store: TaskStore,
        assigner: Arc<dyn AssignmentClient>,
        completion: CompletionPipeline,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            assigner,
            completion,
            config,
        }
    }

    /// One reconcile pass over a task id.
    pub async fn reconcile(&self, id: Uuid) -> Result<Action, ReconcileError> {
        let Some(task) = self.store.try_get(id).await? else {
            // Deleted; claims cascaded with it.
            return Ok(Action::done());
        };

        if task.is_terminal() {
            return self.cleanup_terminal(&task).await;
        }

        if task.cancel_requested {
            return self.cancel(&task).await;
        }

        if task.succeeded_condition().is_none() {
            return self.initialize(task).await;
        }

        // The timeout counts from the one-and-only startTime, surviving
        // sandbox reincarnations.
        if let Some(start) = task.start_time {
            let deadline = start
                + chrono::Duration::from_std(task.timeout())
                .unwrap_or_else(|_| chrono::Duration::seconds(30 * 60));
            if Utc::now() >= deadline {
                return self.time_out(&task).await;
            }
        }

        if let Some(grace) = task.grace_deadline {
            return self.handle_grace(task, grace).await;
        }

        match task.sandbox_claim_name.clone() {
            None => self.ensure_claim(task).await,
            Some(name) => self.observe_claim(task, &name).await,
        }
    }

    // -- phase handlers -----------------------------------------------------

    /// First pass after creation: record the initial condition.
    async fn initialize(&self, mut task: Task) -> Result<Action, ReconcileError> {
        task.set_succeeded_condition(ConditionStatus::Unknown, "Pending", "waiting for sandbox");
        if self.update(&task).await?.is_none() {
            return Ok(Action::requeue(SHORT_REQUEUE));
        }
        recorder::record(task.id, EventKind::Normal, "Accepted", "task accepted");
        Ok(Action::requeue(SHORT_REQUEUE))
    }

    /// Create the sandbox claim, or adopt one left by a crashed pass.
    async fn ensure_claim(&self, mut task: Task) -> Result<Action, ReconcileError> {
        match self.store.claim_for_task(task.id).await? {
            Some(existing) => {
                task.sandbox_claim_name = Some(existing.name);
            }
            None => {
                let name = claim_name(&task);
                self.store
                    .create_claim(&name, &task.namespace, task.id, &task.sandbox_template)
                    .await?;
                recorder::record(
                    task.id,
                    EventKind::Normal,
                    "ClaimCreated",
                    &format!("created sandbox claim {name}"),
                );
                task.sandbox_claim_name = Some(name);
            }
        }

        if self.update(&task).await?.is_none() {
            return Ok(Action::requeue(SHORT_REQUEUE));
        }
        Ok(Action::requeue(CLAIM_WAIT_REQUEUE))
    }

    /// Act on the observed claim state.
    async fn observe_claim(&self, task: Task, name: &str) -> Result<Action, ReconcileError> {
        let Some(claim) = self.store.get_claim(name).await? else {
            return self.infra_retry(task, "sandbox claim disappeared").await;
        };

        match claim.ready {
            ConditionStatus::True if claim.is_ready() => {
                if task.phase == TaskPhase::Running && task.start_time.is_some() {
                    // Healthy and running: wake precisely at the deadline so
                    // the timeout fires without any external event.
                    Ok(Action::requeue(self.remaining_timeout(&task)))
                } else {
                    self.assign(task, &claim).await
                }
            }
            // Ready without an address yet, or still pending fulfillment.
            ConditionStatus::True | ConditionStatus::Unknown => {
                Ok(Action::requeue(CLAIM_WAIT_REQUEUE))
            }
            ConditionStatus::False => {
                if task.phase == TaskPhase::Running {
                    self.enter_grace(task).await
                } else {
                    // Never came up: pod unschedulable, claim expired, ...
                    let detail = claim_failure_message(&claim);
                    self.infra_retry(task, &detail).await
                }
            }
        }
    }

    /// POST the assignment and flip the task to Running.
    ///
    /// 200 and 409 are both success: a 409 means a previous pass delivered
    /// the assignment but crashed before recording it. Anything retriable
    /// leaves the task Pending for a backoff requeue.
    async fn assign(&self, mut task: Task, claim: &SandboxClaim) -> Result<Action, ReconcileError> {
        let fqdn = claim
            .service_fqdn
            .as_deref()
            .expect("is_ready implies a service address");

        let request = AssignmentRequest {
            task_id: task.id,
            api_url: self.config.api_url.clone(),
        };

        match self.assigner.assign(fqdn, &request).await {
            Ok(_outcome) => {
                if task.start_time.is_none() {
                    task.start_time = Some(Utc::now());
                }
                task.phase = TaskPhase::Running;
                let sandbox = claim.sandbox_name.as_deref().unwrap_or(fqdn);
                task.set_succeeded_condition(
                    ConditionStatus::Unknown,
                    "Running",
                    &format!("assigned to sandbox {sandbox}"),
                );
                if self.update(&task).await?.is_none() {
                    return Ok(Action::requeue(SHORT_REQUEUE));
                }
                recorder::record(
                    task.id,
                    EventKind::Normal,
                    "Assigned",
                    &format!("runner on {fqdn} accepted the task"),
                );
                Ok(Action::requeue(self.remaining_timeout(&task)))
            }
            Err(AssignError::Retriable(detail)) => {
                recorder::record(
                    task.id,
                    EventKind::Warning,
                    "AssignRetry",
                    &format!("assignment to {fqdn} failed: {detail}"),
                );
                Err(ReconcileError::Transient(detail))
            }
            Err(AssignError::Refused(status)) => {
                recorder::record(
                    task.id,
                    EventKind::Warning,
                    "AssignRefused",
                    &format!("runner on {fqdn} refused the assignment with status {status}"),
                );
                self.delete_claim_if_any(&task).await?;
                self.completion
                    .complete(
                        task.id,
                        TerminalOutcome::failed(
                            format!("assignment permanently refused: status {status}"),
                            serde_json::Value::Null,
                        ),
                    )
                    .await?;
                Ok(Action::done())
            }
        }
    }

    /// Open the grace window: the runner may be about to report success
    /// while its sandbox is torn down, so failure is deferred.
    ///
    /// The deadline is stored on the task, not kept in memory, so a
    /// reconciler restart resumes the same window.
    async fn enter_grace(&self, mut task: Task) -> Result<Action, ReconcileError> {
        let deadline = Utc::now()
            + chrono::Duration::from_std(self.config.grace_duration)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));
        task.grace_deadline = Some(deadline);
        if self.update(&task).await?.is_none() {
            return Ok(Action::requeue(SHORT_REQUEUE));
        }
        recorder::record(
            task.id,
            EventKind::Warning,
            "GraceStarted",
            "sandbox went not-ready while running; waiting for a late status report",
        );
        Ok(Action::requeue(self.config.grace_duration))
    }

    /// A pass inside or at the end of a grace window. The task was
    /// refetched on entry, so a terminal transition that landed through
    /// the status endpoint has already short-circuited this pass.
    async fn handle_grace(
        &self,
        mut task: Task,
        deadline: chrono::DateTime<Utc>,
    ) -> Result<Action, ReconcileError> {
        let now = Utc::now();
        if now < deadline {
            let remaining = (deadline - now).to_std().unwrap_or(Duration::ZERO);
            return Ok(Action::requeue(remaining));
        }

        let claim = match &task.sandbox_claim_name {
            Some(name) => self.store.get_claim(name).await?,
            None => None,
        };

        let Some(claim) = claim else {
            return self.infra_retry(task, "sandbox claim disappeared").await;
        };

        if claim.is_ready() {
            // The sandbox recovered; close the window and keep running.
            task.grace_deadline = None;
            if self.update(&task).await?.is_none() {
                return Ok(Action::requeue(SHORT_REQUEUE));
            }
            recorder::record(
                task.id,
                EventKind::Normal,
                "GraceCancelled",
                "sandbox became ready again",
            );
            return Ok(Action::requeue(self.remaining_timeout(&task)));
        }

        // Window elapsed with the sandbox still gone: classify.
        let detail = claim_failure_message(&claim);
        let reason = claim.reason.as_deref().unwrap_or("");
        if claim_reasons::EXPIRY_REASONS.contains(&reason) {
            self.delete_claim_if_any(&task).await?;
            self.completion
                .complete(
                    task.id,
                    TerminalOutcome::timed_out(format!("sandbox expired: {detail}")),
                )
                .await?;
            Ok(Action::done())
        } else if claim_reasons::INFRA_REASONS.contains(&reason) {
            self.infra_retry(task, &detail).await
        } else {
            self.delete_claim_if_any(&task).await?;
            self.completion
                .complete(
                    task.id,
                    TerminalOutcome::failed(
                        format!("sandbox terminated: {detail}"),
                        serde_json::Value::Null,
                    ),
                )
                .await?;
            Ok(Action::done())
        }
    }

    /// Reincarnate the sandbox below the retry cap, or fail permanently.
    async fn infra_retry(&self, mut task: Task, detail: &str) -> Result<Action, ReconcileError> {
        self.delete_claim_if_any(&task).await?;

        if task.retry_count >= self.config.max_infra_retries {
            recorder::record(
                task.id,
                EventKind::Warning,
                "RetriesExhausted",
                &format!(
                    "giving up after {} sandbox retries: {detail}",
                    task.retry_count
                ),
            );
            self.completion
                .complete(
                    task.id,
                    TerminalOutcome::failed(
                        format!(
                            "sandbox failed after {} retries: {detail}",
                            task.retry_count
                        ),
                        serde_json::Value::Null,
                    ),
                )
                .await?;
            return Ok(Action::done());
        }

        task.retry_count += 1;
        task.sandbox_claim_name = None;
        task.grace_deadline = None;
        task.phase = TaskPhase::Pending;
        task.set_succeeded_condition(
            ConditionStatus::Unknown,
            "Pending",
            &format!("reincarnating sandbox (retry {}): {detail}", task.retry_count),
        );
        if self.update(&task).await?.is_none() {
            return Ok(Action::requeue(SHORT_REQUEUE));
        }
        recorder::record(
            task.id,
            EventKind::Warning,
            "SandboxRetry",
            &format!("retry {} of {}: {detail}", task.retry_count, self.config.max_infra_retries),
        );
        Ok(Action::requeue(SHORT_REQUEUE))
    }

    /// The spec-level cancel flag is handled like a timeout.
    async fn cancel(&self, task: &Task) -> Result<Action, ReconcileError> {
        self.delete_claim_if_any(task).await?;
        self.completion
            .complete(task.id, TerminalOutcome::cancelled("task cancelled"))
            .await?;
        recorder::record(task.id, EventKind::Normal, "Cancelled", "task cancelled");
        Ok(Action::done())
    }

    /// Deadline passed with no terminal report from the runner.
    async fn time_out(&self, task: &Task) -> Result<Action, ReconcileError> {
        self.delete_claim_if_any(task).await?;
        self.completion
            .complete(
                task.id,
                TerminalOutcome::timed_out(format!(
                    "task timed out after {}s",
                    task.timeout().as_secs()
                )),
            )
            .await?;
        Ok(Action::done())
    }

    /// Terminal tasks are absorbing; the only remaining duty is making
    /// sure the claim is gone, whichever path finished the task.
    async fn cleanup_terminal(&self, task: &Task) -> Result<Action, ReconcileError> {
        if let Some(claim) = self.store.claim_for_task(task.id).await? {
            self.store.delete_claim(&claim.name).await?;
            recorder::record(
                task.id,
                EventKind::Normal,
                "ClaimDeleted",
                &format!("deleted sandbox claim {} for finished task", claim.name),
            );
        }
        Ok(Action::done())
    }

    // -- helpers ------------------------------------------------------------

    /// Status write that treats an optimistic conflict as "someone else
    /// moved the task, come back shortly" rather than an error.
    async fn update(&self, task: &Task) -> Result<Option<Task>, ReconcileError> {
        match self.store.update_status(task).await {
            Ok(updated) => Ok(Some(updated)),
            Err(e) if e.is_conflict() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_claim_if_any(&self, task: &Task) -> Result<(), ReconcileError> {
        if let Some(name) = &task.sandbox_claim_name {
            self.store.delete_claim(name).await?;
        } else if let Some(claim) = self.store.claim_for_task(task.id).await? {
            self.store.delete_claim(&claim.name).await?;
        }
        Ok(())
    }

    /// Time until the task's deadline, zero when already past.
    fn remaining_timeout(&self, task: &Task) -> Duration {
        let Some(start) = task.start_time else {
            return CLAIM_WAIT_REQUEUE;
        };
        let deadline =
            start + chrono::Duration::from_std(task.timeout())
                .unwrap_or_else(|_| chrono::Duration::seconds(30 * 60));
        (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Deterministic claim name per (task, incarnation).
fn claim_name(task: &Task) -> String {
    format!("sbx-{}-{}", task.id.simple(), task.retry_count)
}

fn claim_failure_message(claim: &SandboxClaim) -> String {
    match (&claim.reason, &claim.message) {
        (Some(reason), Some(message)) => format!("{reason}: {message}"),
        (Some(reason), None) => reason.clone(),
        (None, Some(message)) => message.clone(),
        (None, None) => "sandbox not ready".to_string(),
    }
}
