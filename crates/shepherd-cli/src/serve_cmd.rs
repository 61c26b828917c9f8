//! The `shepherd serve` command: wire the store, lifecycle engine, and
//! HTTP surfaces together and run until interrupted.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use shepherd_core::assign::HttpAssignmentClient;
use shepherd_core::callback::{CallbackConfig, CallbackDispatcher};
use shepherd_core::completion::CompletionPipeline;
use shepherd_core::events::EventLog;
use shepherd_core::leader::{LeaderConfig, lead};
use shepherd_core::reconcile::controller::{ControllerConfig, run_controller};
use shepherd_core::reconcile::{Reconciler, ReconcilerConfig};
use shepherd_core::token::{VcsAppConfig, issuer_from_config};
use shepherd_store::config::DbConfig;
use shepherd_store::{TaskStore, pool};

use crate::api::{AppState, health_router, internal_router, public_router};
use crate::config::ShepherdConfig;

pub async fn run_serve(config: ShepherdConfig) -> Result<()> {
    // Store first: an unreachable database is an initialization failure.
    let db_pool = pool::create_pool(&DbConfig::new(&config.database_url))
        .await
        .context("failed to open the task store")?;
    pool::run_migrations(&db_pool)
        .await
        .context("failed to apply the store schema")?;
    let store = TaskStore::new(db_pool);

    let cancel = CancellationToken::new();
    let events = Arc::new(EventLog::new(config.event_ring_capacity));
    let callbacks = CallbackDispatcher::spawn(
        config.callback_secret.clone(),
        CallbackConfig::default(),
        cancel.clone(),
    );
    let completion = CompletionPipeline::new(store.clone(), Arc::clone(&events), callbacks);

    let issuer = issuer_from_config(VcsAppConfig::from_parts(
        config.vcs_app_id.clone(),
        config.vcs_installation_id.clone(),
        config.vcs_private_key_path.clone(),
    ));

    // Leader-gated reconcile loop; standbys poll the lease.
    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        Arc::new(HttpAssignmentClient::new()?),
        completion.clone(),
        ReconcilerConfig {
            namespace: config.namespace.clone(),
            api_url: config.public_api_url.clone(),
            max_infra_retries: config.max_infra_retries,
            grace_duration: config.grace_duration,
        },
    ));
    let leader_handle = {
        let store = store.clone();
        let cancel = cancel.clone();
        let namespace = config.namespace.clone();
        tokio::spawn(async move {
            let body = {
                let store = store.clone();
                move |child: CancellationToken| {
                    run_controller(
                        store.clone(),
                        Arc::clone(&reconciler),
                        namespace.clone(),
                        ControllerConfig::default(),
                        child,
                    )
                }
            };
            if let Err(e) = lead(store, LeaderConfig::default(), cancel, body).await {
                tracing::error!(error = %e, "leader loop failed");
            }
        })
    };

    let state = AppState {
        store,
        events,
        completion,
        issuer,
        namespace: config.namespace.clone(),
        default_timeout_secs: config.default_timeout_secs,
    };

    if config.metrics_listen.is_some() {
        tracing::info!("metrics_listen configured but exporters are external; ignoring");
    }

    // Bind all surfaces before serving so a taken port fails startup.
    let api_listener = tokio::net::TcpListener::bind(config.api_listen)
        .await
        .with_context(|| format!("failed to bind api listener on {}", config.api_listen))?;
    let internal_listener = tokio::net::TcpListener::bind(config.internal_listen)
        .await
        .with_context(|| {
            format!(
                "failed to bind internal listener on {}",
                config.internal_listen
            )
        })?;
    let health_listener = tokio::net::TcpListener::bind(config.health_listen)
        .await
        .with_context(|| format!("failed to bind health listener on {}", config.health_listen))?;

    tracing::info!(
        api = %config.api_listen,
        internal = %config.internal_listen,
        health = %config.health_listen,
        namespace = %config.namespace,
        "shepherd serving"
    );

    let shutdown = |cancel: CancellationToken| async move { cancel.cancelled().await };
    let api_server = axum::serve(api_listener, public_router(state.clone()))
        .with_graceful_shutdown(shutdown(cancel.clone()));
    let internal_server = axum::serve(internal_listener, internal_router(state.clone()))
        .with_graceful_shutdown(shutdown(cancel.clone()));
    let health_server = axum::serve(health_listener, health_router())
        .with_graceful_shutdown(shutdown(cancel.clone()));

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            signal_cancel.cancel();
        }
    });

    use std::future::IntoFuture;
    let (api, internal, health) = tokio::join!(
        api_server.into_future(),
        internal_server.into_future(),
        health_server.into_future()
    );
    api.context("api server failed")?;
    internal.context("internal server failed")?;
    health.context("health server failed")?;

    cancel.cancel();
    let _ = leader_handle.await;
    tracing::info!("shepherd shut down");
    Ok(())
}
