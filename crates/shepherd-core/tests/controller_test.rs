//! End-to-end controller tests: watch-fed workqueue, worker pool, a fake
//! provisioner fulfilling claims, and leader-lease handover.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use shepherd_core::assign::{AssignError, AssignOutcome, AssignmentClient, AssignmentRequest};
use shepherd_core::callback::{CallbackConfig, CallbackDispatcher};
use shepherd_core::completion::{CompletionPipeline, TerminalOutcome};
use shepherd_core::events::EventLog;
use shepherd_core::leader::{LeaderConfig, lead};
use shepherd_core::reconcile::controller::{ControllerConfig, run_controller};
use shepherd_core::reconcile::{Reconciler, ReconcilerConfig};
use shepherd_store::TaskStore;
use shepherd_store::models::{ConditionStatus, TaskPhase};
use shepherd_test_utils::{memory_store, new_task};

/// Always-accepting assignment client.
struct AcceptingAssigner;

#[async_trait]
impl AssignmentClient for AcceptingAssigner {
    async fn assign(
        &self,
        _service_fqdn: &str,
        _request: &AssignmentRequest,
    ) -> Result<AssignOutcome, AssignError> {
        Ok(AssignOutcome::Accepted)
    }
}

/// Poll the store, fulfilling every pending claim like the external
/// provisioner would.
fn spawn_provisioner(store: TaskStore, cancel: CancellationToken) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(20)) => {}
                _ = cancel.cancelled() => break,
            }
            let Ok(pending) = store.pending_claims("default").await else {
                continue;
            };
            for claim in pending {
                let _ = store
                    .update_claim_status(
                        &claim.name,
                        ConditionStatus::True,
                        Some("SandboxReady"),
                        None,
                        Some("sbx-pod"),
                        Some("sbx-pod.default.svc"),
                    )
                    .await;
            }
        }
    });
}

async fn wait_for<F>(store: &TaskStore, id: uuid::Uuid, what: &str, predicate: F)
-> shepherd_store::models::Task
where
    F: Fn(&shepherd_store::models::Task) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Ok(Some(task)) = store.try_get(id).await {
            if predicate(&task) {
                return task;
            }
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for task {id} to be {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

struct World {
    store: TaskStore,
    completion: CompletionPipeline,
    cancel: CancellationToken,
}

async fn start_world() -> World {
    let store = memory_store().await;
    let cancel = CancellationToken::new();
    let events = Arc::new(EventLog::default());
    let callbacks = CallbackDispatcher::spawn(
        b"controller-test-secret".to_vec(),
        CallbackConfig::default(),
        cancel.clone(),
    );
    let completion = CompletionPipeline::new(store.clone(), events, callbacks);
    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        Arc::new(AcceptingAssigner),
        completion.clone(),
        ReconcilerConfig::default(),
    ));

    spawn_provisioner(store.clone(), cancel.clone());

    let controller_store = store.clone();
    let controller_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = run_controller(
            controller_store,
            reconciler,
            "default".to_string(),
            ControllerConfig {
                workers: 2,
                error_backoff_base: Duration::from_millis(20),
                ..ControllerConfig::default()
            },
            controller_cancel,
        )
        .await;
    });

    World {
        store,
        completion,
        cancel,
    }
}

#[tokio::test]
async fn controller_drives_a_task_to_running_and_cleans_up_after_success() {
    let world = start_world().await;

    let task = world.store.create(&new_task("default")).await.unwrap();

    // Watch feeds the queue; workers create the claim; the provisioner
    // fulfills it; assignment flips the task to Running.
    let running = wait_for(&world.store, task.id, "running", |t| {
        t.phase == TaskPhase::Running
    })
    .await;
    assert!(running.start_time.is_some());
    assert!(running.sandbox_claim_name.is_some());

    // The runner reports success; the next reconcile removes the claim.
    world
        .completion
        .complete(
            task.id,
            TerminalOutcome::succeeded(
                "pull request opened",
                Some("https://github.com/org/repo/pull/7".to_string()),
                serde_json::Value::Null,
            ),
        )
        .await
        .unwrap();

    let done = wait_for(&world.store, task.id, "cleaned up", |t| t.is_terminal()).await;
    assert_eq!(done.phase, TaskPhase::Succeeded);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let claims = shepherd_store::queries::claims::count_claims_for_task(
            world.store.pool(),
            task.id,
        )
        .await
        .unwrap();
        if claims == 0 {
            break;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("claim never deleted after terminal transition");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    world.cancel.cancel();
}

#[tokio::test]
async fn controller_cancels_a_task_on_request() {
    let world = start_world().await;

    let task = world.store.create(&new_task("default")).await.unwrap();
    wait_for(&world.store, task.id, "running", |t| {
        t.phase == TaskPhase::Running
    })
    .await;

    world.store.request_cancel(task.id).await.unwrap();
    let done = wait_for(&world.store, task.id, "cancelled", |t| t.is_terminal()).await;
    assert_eq!(done.phase, TaskPhase::Cancelled);

    world.cancel.cancel();
}

#[tokio::test]
async fn two_tasks_progress_independently() {
    let world = start_world().await;

    let a = world.store.create(&new_task("default")).await.unwrap();
    let b = world.store.create(&new_task("default")).await.unwrap();

    wait_for(&world.store, a.id, "running", |t| t.phase == TaskPhase::Running).await;
    wait_for(&world.store, b.id, "running", |t| t.phase == TaskPhase::Running).await;

    world
        .completion
        .complete(a.id, TerminalOutcome::failed("runner crashed", serde_json::Value::Null))
        .await
        .unwrap();

    let a_done = wait_for(&world.store, a.id, "terminal", |t| t.is_terminal()).await;
    assert_eq!(a_done.phase, TaskPhase::Failed);

    let b_alive = world.store.get(b.id).await.unwrap();
    assert_eq!(b_alive.phase, TaskPhase::Running, "other task unaffected");

    world.cancel.cancel();
}

// ---------------------------------------------------------------------------
// Leader election
// ---------------------------------------------------------------------------

#[tokio::test]
async fn only_one_leader_runs_and_standby_takes_over() {
    let store = memory_store().await;
    let active = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));

    let config = |holder: &str| LeaderConfig {
        lease_name: "test-lease".to_string(),
        holder: holder.to_string(),
        ttl: Duration::from_millis(300),
        renew_interval: Duration::from_millis(80),
        retry_interval: Duration::from_millis(50),
    };

    let body = |active: Arc<std::sync::atomic::AtomicUsize>,
                peak: Arc<std::sync::atomic::AtomicUsize>| {
        move |cancel: CancellationToken| {
            let active = active.clone();
            let peak = peak.clone();
            async move {
                let now = active.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                peak.fetch_max(now, std::sync::atomic::Ordering::SeqCst);
                cancel.cancelled().await;
                active.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                Ok::<(), anyhow::Error>(())
            }
        }
    };

    let cancel_a = CancellationToken::new();
    let cancel_b = CancellationToken::new();

    let a = tokio::spawn(lead(
        store.clone(),
        config("alpha"),
        cancel_a.clone(),
        body(active.clone(), peak.clone()),
    ));
    // Give alpha a head start so the winner is deterministic.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let b = tokio::spawn(lead(
        store.clone(),
        config("beta"),
        cancel_b.clone(),
        body(active.clone(), peak.clone()),
    ));

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(
        active.load(std::sync::atomic::Ordering::SeqCst),
        1,
        "exactly one leader while both contend"
    );

    // Alpha steps down; beta must take over once the lease lapses.
    cancel_a.cancel();
    let _ = a.await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if active.load(std::sync::atomic::Ordering::SeqCst) == 1 {
            break;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("standby never took over the lease");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    assert_eq!(
        peak.load(std::sync::atomic::Ordering::SeqCst),
        1,
        "leadership never overlapped"
    );

    cancel_b.cancel();
    let _ = b.await;
}
