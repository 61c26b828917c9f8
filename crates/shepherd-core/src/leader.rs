//! Lease-based leader election for the reconcile loop.
//!
//! One process at a time owns reconciliation; standbys keep retrying the
//! lease. The lease lives in the store, so takeover works across hosts
//! sharing a database. Losing the lease cancels the guarded body and
//! returns the process to the standby loop.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use shepherd_store::TaskStore;

/// Lease parameters.
#[derive(Debug, Clone)]
pub struct LeaderConfig {
    pub lease_name: String,
    /// Unique identity of this process.
    pub holder: String,
    /// How long an un-renewed lease remains valid.
    pub ttl: Duration,
    /// Renewal cadence; must be well under `ttl`.
    pub renew_interval: Duration,
    /// Standby retry cadence while another process leads.
    pub retry_interval: Duration,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            lease_name: "shepherd-reconciler".to_string(),
            holder: format!("shepherd-{}", Uuid::new_v4().simple()),
            ttl: Duration::from_secs(15),
            renew_interval: Duration::from_secs(5),
            retry_interval: Duration::from_secs(5),
        }
    }
}

/// Run `body` only while holding the lease.
///
/// `body` receives a child cancellation token that fires when the lease is
/// lost or the outer token cancels; it must be restartable because a
/// reacquired lease runs it again.
pub async fn lead<F, Fut>(
    store: TaskStore,
    config: LeaderConfig,
    cancel: CancellationToken,
    body: F,
) -> Result<()>
where
    F: Fn(CancellationToken) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    loop {
        // Standby: poll for the lease.
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            match store
                .acquire_lease(&config.lease_name, &config.holder, config.ttl)
                .await
            {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "lease acquisition failed");
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(config.retry_interval) => {}
                _ = cancel.cancelled() => return Ok(()),
            }
        }

        tracing::info!(holder = %config.holder, lease = %config.lease_name, "became leader");
        let child = cancel.child_token();
        let mut guarded = tokio::spawn(body(child.clone()));

        // Renew until the lease slips or we are asked to stop.
        let lost = loop {
            tokio::select! {
                _ = tokio::time::sleep(config.renew_interval) => {
                    match store
                        .acquire_lease(&config.lease_name, &config.holder, config.ttl)
                        .await
                    {
                        Ok(true) => {}
                        Ok(false) => break true,
                        Err(e) => {
                            tracing::warn!(error = %e, "lease renewal failed");
                        }
                    }
                }
                result = &mut guarded => {
                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => tracing::error!(error = %e, "guarded body failed"),
                        Err(e) => tracing::error!(error = %e, "guarded body panicked"),
                    }
                    break false;
                }
                _ = cancel.cancelled() => break false,
            }
        };

        child.cancel();
        if !guarded.is_finished() {
            let _ = guarded.await;
        }

        if cancel.is_cancelled() {
            let _ = store
                .release_lease(&config.lease_name, &config.holder)
                .await;
            return Ok(());
        }

        if lost {
            tracing::warn!(holder = %config.holder, "lost the leader lease; standing by");
        }
    }
}
