//! The reconcile worker pool.
//!
//! A bounded set of workers drains the workqueue; watch events from the
//! store and periodic resyncs feed it. Per-key serialization lives in the
//! queue itself, so a task id never reconciles on two workers at once.
//! Errors requeue with per-key exponential backoff.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use shepherd_store::TaskStore;

use super::workqueue::Workqueue;
use super::{Action, Reconciler};

/// Controller tuning.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Number of reconcile workers.
    pub workers: usize,
    /// First backoff after a reconcile error.
    pub error_backoff_base: Duration,
    /// Backoff ceiling.
    pub error_backoff_max: Duration,
    /// Periodic full resync of active tasks.
    pub resync_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            error_backoff_base: Duration::from_millis(500),
            error_backoff_max: Duration::from_secs(30),
            resync_interval: Duration::from_secs(300),
        }
    }
}

/// Run the controller until cancelled.
///
/// Performs an initial full resync (every task in the namespace, so
/// terminal tasks get their claims verified after a restart), then reacts
/// to watch events and periodic resyncs.
pub async fn run_controller(
    store: TaskStore,
    reconciler: Arc<Reconciler>,
    namespace: String,
    config: ControllerConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let queue: Arc<Workqueue<Uuid>> = Arc::new(Workqueue::new());
    let backoffs: Arc<Mutex<HashMap<Uuid, Duration>>> = Arc::new(Mutex::new(HashMap::new()));

    // Initial resync: cover everything that changed while we were away.
    resync(&store, &namespace, &queue, false).await;

    let mut handles = Vec::new();

    // Watch feeder.
    {
        let store = store.clone();
        let namespace = namespace.clone();
        let queue = Arc::clone(&queue);
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            let mut rx = store.watch();
            loop {
                tokio::select! {
                    change = rx.recv() => match change {
                        Ok(change) => {
                            if let Some(id) = change.task_id() {
                                queue.add(id);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(missed = n, "watch lagged; forcing a resync");
                            resync(&store, &namespace, &queue, true).await;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = cancel.cancelled() => break,
                }
            }
        }));
    }

    // Periodic resync.
    {
        let store = store.clone();
        let namespace = namespace.clone();
        let queue = Arc::clone(&queue);
        let cancel = cancel.clone();
        let interval = config.resync_interval;
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        resync(&store, &namespace, &queue, true).await;
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        }));
    }

    // Workers.
    for worker in 0..config.workers.max(1) {
        let queue = Arc::clone(&queue);
        let reconciler = Arc::clone(&reconciler);
        let backoffs = Arc::clone(&backoffs);
        let cancel = cancel.clone();
        let config = config.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let key = tokio::select! {
                    key = queue.next() => key,
                    _ = cancel.cancelled() => break,
                };

                match reconciler.reconcile(key).await {
                    Ok(Action { requeue_after }) => {
                        backoffs.lock().expect("backoff lock poisoned").remove(&key);
                        if let Some(delay) = requeue_after {
                            queue.add_after(key, delay);
                        }
                    }
                    Err(e) => {
                        let delay = {
                            let mut map = backoffs.lock().expect("backoff lock poisoned");
                            let delay = map
                                .get(&key)
                                .map(|d| (*d * 2).min(config.error_backoff_max))
                                .unwrap_or(config.error_backoff_base);
                            map.insert(key, delay);
                            delay
                        };
                        tracing::warn!(
                            task_id = %key,
                            worker,
                            error = %e,
                            backoff_ms = delay.as_millis() as u64,
                            "reconcile failed; requeueing"
                        );
                        queue.add_after(key, delay);
                    }
                }
                queue.done(&key);
            }
        }));
    }

    cancel.cancelled().await;
    for handle in handles {
        let _ = handle.await;
    }
    tracing::info!("controller stopped");
    Ok(())
}

/// Queue every task (or only live ones) in the namespace.
async fn resync(store: &TaskStore, namespace: &str, queue: &Workqueue<Uuid>, active_only: bool) {
    match store.list(namespace, &[], active_only).await {
        Ok(tasks) => {
            for task in tasks {
                queue.add(task.id);
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "resync list failed");
        }
    }
}
