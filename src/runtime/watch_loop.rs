//! # Watch Loop
//!
//! Watches `Terraform` resources and drives reconciliation through
//! `kube-runtime`.
//!
//! Every event is handed to the reconciler. Status-only updates are not
//! filtered: a tick on an unchanged object is idempotent and writes nothing,
//! and timed work is scheduled through the requeue the reconciler returns.

use crate::config::ControllerConfig;
use crate::controller::reconciler::{reconcile, Reconciler, ReconcilerError};
use crate::controller::server::ServerState;
use crate::crd::Terraform;
use crate::runtime::error_policy::{handle_reconciliation_error, handle_watch_stream_error};
use futures::StreamExt;
use kube::api::Api;
use kube_runtime::{controller, controller::Action, watcher, Controller};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tracing::{debug, error, info, warn, Instrument};

/// Run the controller until a shutdown signal arrives
///
/// The controller stream is restarted when it ends or fails; a shutdown
/// signal marks the server not ready and stops the restarts.
pub async fn run_watch_loop(
    modules: Api<Terraform>,
    reconciler: Arc<Reconciler>,
    server_state: Arc<ServerState>,
    config: ControllerConfig,
) -> Result<(), anyhow::Error> {
    let backoff_duration_ms = Arc::new(AtomicU64::new(config.backoff_base_ms));

    let shutdown_state = Arc::clone(&server_state);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("Received shutdown signal (SIGINT/SIGTERM), initiating graceful shutdown...");
        shutdown_state.set_ready(false);
        info!("Marked server as not ready, waiting for in-flight reconciliations to complete...");
    });

    let concurrency = u16::try_from(config.max_concurrent_reconciles).unwrap_or(u16::MAX);

    loop {
        if !server_state.ready() {
            info!("Shutdown requested, exiting watch loop");
            break;
        }

        let watch_span = tracing::span!(
            tracing::Level::INFO,
            "controller.watch",
            operation = "watch_loop"
        );
        watch_span.in_scope(|| info!("Starting controller watch loop..."));

        let backoff = Arc::clone(&backoff_duration_ms);
        let base_ms = config.backoff_base_ms;
        let max_ms = config.backoff_max_ms;
        let restart_delay = config.watch_restart_delay_duration();

        Controller::new(modules.clone(), watcher::Config::default().any_semantic())
            .with_config(controller::Config::default().concurrency(concurrency))
            .shutdown_on_signal()
            .run(
                create_reconcile_fn,
                |obj, error, ctx| handle_reconciliation_error(obj, error, ctx),
                Arc::clone(&reconciler),
            )
            .filter_map(move |event| {
                let backoff = Arc::clone(&backoff);
                async move {
                    match &event {
                        Ok(_) => {
                            backoff.store(base_ms, std::sync::atomic::Ordering::Relaxed);
                            debug!("watch.event.success");
                            Some(event)
                        }
                        Err(e) => {
                            let error_string = format!("{e:?}");
                            handle_watch_stream_error(&error_string, &backoff, max_ms, restart_delay)
                                .await
                                .map(|()| event)
                        }
                    }
                }
            })
            .for_each(|_| futures::future::ready(()))
            .instrument(watch_span)
            .await;

        if !server_state.ready() {
            info!("Shutdown requested, exiting watch loop");
            break;
        }

        let delay = config.watch_restart_delay_after_end_duration();
        warn!(
            "Controller watch stream ended, restarting in {} seconds...",
            delay.as_secs()
        );
        tokio::time::sleep(delay).await;
    }

    info!("Controller stopped gracefully");
    Ok(())
}

fn create_reconcile_fn(
    obj: Arc<Terraform>,
    ctx: Arc<Reconciler>,
) -> impl std::future::Future<Output = Result<Action, ReconcilerError>> + Send {
    let name = obj.metadata.name.clone().unwrap_or_default();
    let generation = obj.metadata.generation.unwrap_or(0);
    let observed_generation = obj
        .status
        .as_ref()
        .and_then(|s| s.observed_generation)
        .unwrap_or(0);
    debug!(
        resource.name = name.as_str(),
        generation,
        observed_generation,
        "watch.event.received"
    );

    async move {
        let result = reconcile(obj, ctx).await;
        match &result {
            Ok(action) => debug!(resource.name = name.as_str(), action = ?action, "watch.event.reconciled"),
            Err(e) => error!(resource.name = name.as_str(), error = %e, "watch.event.reconciliation_failed"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn test_watch_loop_future_is_send() {
        // Never called: compiling it is the check
        let _ = |modules: Api<Terraform>,
                 reconciler: Arc<Reconciler>,
                 state: Arc<ServerState>,
                 config: ControllerConfig| {
            assert_send(&run_watch_loop(modules, reconciler, state, config));
        };
    }
}
