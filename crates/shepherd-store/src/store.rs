//! The task store facade: queries plus an in-process watch hub.
//!
//! Every successful write publishes a [`TaskChange`] on a broadcast
//! channel. Delivery is at-least-once within the process; a lagged
//! receiver learns it lagged and resubscribes, and level-triggered
//! reconciliation absorbs any intermediate states it missed.

use std::time::Duration;

use sqlx::SqlitePool;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{ConditionStatus, NewTask, SandboxClaim, Task};
use crate::queries::{claims, leases, tasks};

/// Capacity of the watch broadcast channel.
const WATCH_CAPACITY: usize = 256;

/// One observed task mutation: `new` is `None` for deletions, `old` is
/// `None` for creations and for changes whose pre-image was not in hand.
#[derive(Debug, Clone)]
pub struct TaskChange {
    pub old: Option<Task>,
    pub new: Option<Task>,
}

impl TaskChange {
    /// Id of the affected task.
    pub fn task_id(&self) -> Option<Uuid> {
        self.new
            .as_ref()
            .or(self.old.as_ref())
            .map(|t| t.id)
    }
}

/// Handle to the durable task store.
#[derive(Clone)]
pub struct TaskStore {
    pool: SqlitePool,
    watch_tx: broadcast::Sender<TaskChange>,
}

impl TaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        let (watch_tx, _) = broadcast::channel(WATCH_CAPACITY);
        Self { pool, watch_tx }
    }

    /// Raw pool, for query modules not wrapped here.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Subscribe to task mutations.
    pub fn watch(&self) -> broadcast::Receiver<TaskChange> {
        self.watch_tx.subscribe()
    }

    fn publish(&self, old: Option<Task>, new: Option<Task>) {
        // Send fails only when nobody is watching.
        let _ = self.watch_tx.send(TaskChange { old, new });
    }

    // -- tasks --------------------------------------------------------------

    /// Create a task and announce it to watchers.
    pub async fn create(&self, new: &NewTask) -> Result<Task, StoreError> {
        let task = tasks::insert_task(&self.pool, new).await?;
        self.publish(None, Some(task.clone()));
        Ok(task)
    }

    /// Fetch a task, erroring when absent.
    pub async fn get(&self, id: Uuid) -> Result<Task, StoreError> {
        tasks::get_task(&self.pool, id)
            .await?
            .ok_or(StoreError::NotFound {
                kind: "task",
                id: id.to_string(),
            })
    }

    /// Fetch a task that may be absent.
    pub async fn try_get(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        tasks::get_task(&self.pool, id).await
    }

    /// List tasks by namespace, label selector, and liveness.
    pub async fn list(
        &self,
        namespace: &str,
        selector: &[(String, String)],
        active_only: bool,
    ) -> Result<Vec<Task>, StoreError> {
        tasks::list_tasks(&self.pool, namespace, selector, active_only).await
    }

    /// Write status under optimistic concurrency; see
    /// [`tasks::update_task_status`].
    pub async fn update_status(&self, task: &Task) -> Result<Task, StoreError> {
        let updated = tasks::update_task_status(&self.pool, task).await?;
        self.publish(Some(task.clone()), Some(updated.clone()));
        Ok(updated)
    }

    /// Set the spec-level cancel flag.
    pub async fn request_cancel(&self, id: Uuid) -> Result<Task, StoreError> {
        let task = tasks::request_cancel(&self.pool, id).await?;
        self.publish(None, Some(task.clone()));
        Ok(task)
    }

    /// Claim the one-token-per-generation slot.
    pub async fn claim_token_generation(
        &self,
        id: Uuid,
        generation: i64,
    ) -> Result<(), StoreError> {
        tasks::claim_token_generation(&self.pool, id, generation).await
    }

    /// Delete a task (claims cascade) and announce the deletion.
    pub async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        let old = tasks::get_task(&self.pool, id).await?;
        tasks::delete_task(&self.pool, id).await?;
        self.publish(old, None);
        Ok(())
    }

    // -- sandbox claims -----------------------------------------------------

    /// Create a claim owned by a task.
    pub async fn create_claim(
        &self,
        name: &str,
        namespace: &str,
        task_id: Uuid,
        template: &str,
    ) -> Result<SandboxClaim, StoreError> {
        claims::insert_claim(&self.pool, name, namespace, task_id, template).await
    }

    /// Fetch a claim by name.
    pub async fn get_claim(&self, name: &str) -> Result<Option<SandboxClaim>, StoreError> {
        claims::get_claim(&self.pool, name).await
    }

    /// Fetch the claim owned by a task.
    pub async fn claim_for_task(&self, task_id: Uuid) -> Result<Option<SandboxClaim>, StoreError> {
        claims::get_claim_for_task(&self.pool, task_id).await
    }

    /// Claims the provisioner has not fulfilled yet.
    pub async fn pending_claims(&self, namespace: &str) -> Result<Vec<SandboxClaim>, StoreError> {
        claims::list_pending_claims(&self.pool, namespace).await
    }

    /// Publish claim status and nudge the owning task's reconciliation.
    pub async fn update_claim_status(
        &self,
        name: &str,
        ready: ConditionStatus,
        reason: Option<&str>,
        message: Option<&str>,
        sandbox_name: Option<&str>,
        service_fqdn: Option<&str>,
    ) -> Result<SandboxClaim, StoreError> {
        let claim = claims::update_claim_status(
            &self.pool,
            name,
            ready,
            reason,
            message,
            sandbox_name,
            service_fqdn,
        )
        .await?;

        // A claim status change is a reconcile trigger for its owner.
        if let Some(task) = tasks::get_task(&self.pool, claim.task_id).await? {
            self.publish(None, Some(task));
        }

        Ok(claim)
    }

    /// Delete a claim; absent claims are fine.
    pub async fn delete_claim(&self, name: &str) -> Result<bool, StoreError> {
        claims::delete_claim(&self.pool, name).await
    }

    // -- leases -------------------------------------------------------------

    /// Acquire or renew the named leader lease.
    pub async fn acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        leases::acquire_lease(&self.pool, name, holder, ttl).await
    }

    /// Release the named lease if held by `holder`.
    pub async fn release_lease(&self, name: &str, holder: &str) -> Result<(), StoreError> {
        leases::release_lease(&self.pool, name, holder).await
    }
}
