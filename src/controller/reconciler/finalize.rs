//! # Finalize
//!
//! Deletion path: destroy the managed resources when asked to, then drop the
//! outputs secret and the runner pod and release the finalizer.

use crate::constants::FINALIZER;
use crate::controller::lock;
use crate::controller::reconciler::inputs::init_request;
use crate::controller::reconciler::reconcile::enter_locked_phase;
use crate::controller::reconciler::status::{set_ready, STATUS_FALSE};
use crate::controller::reconciler::types::{Reconciler, ReconcilerError};
use crate::controller::session::DestroyRequest;
use crate::controller::source::SourceState;
use crate::controller::store::{patch_status, remove_finalizer, ObjectKey};
use crate::crd::{Phase, Terraform};
use crate::observability;
use chrono::Utc;
use kube::ResourceExt;
use kube_runtime::controller::Action;
use tracing::{info, warn};

/// Run the deletion path of a module carrying the controller finalizer
pub async fn finalize(
    ctx: &Reconciler,
    key: &ObjectKey,
    tf: &Terraform,
) -> Result<Action, ReconcilerError> {
    if !tf.finalizers().iter().any(|f| f == FINALIZER) {
        ctx.forget(key);
        return Ok(Action::await_change());
    }

    let owns_resources = tf
        .status
        .as_ref()
        .is_some_and(|status| !status.inventory_is_empty());
    if tf.spec.destroy_resources_on_deletion && owns_resources {
        destroy(ctx, key, tf).await?;
    } else {
        info!("Skipping destroy on deletion");
    }

    if let Some(outputs) = &tf.spec.write_outputs_to_secret {
        let namespace = tf.namespace().unwrap_or_default();
        ctx.collaborators
            .secrets
            .delete_outputs(&namespace, &outputs.name)
            .await?;
    }
    if let Err(e) = ctx.collaborators.runners.teardown(tf).await {
        warn!(error = %e, "Runner pod teardown failed during finalization");
    }

    let now = Utc::now();
    patch_status(
        ctx.collaborators.store.as_ref(),
        key,
        ctx.config.conflict_retry_limit,
        |tf, status| {
            status.phase = Some(Phase::Finalized);
            lock::release(status);
            set_ready(
                status,
                STATUS_FALSE,
                "Finalized",
                "Resource is being deleted",
                tf.metadata.generation,
                now,
            );
        },
    )
    .await?;
    remove_finalizer(
        ctx.collaborators.store.as_ref(),
        key,
        FINALIZER,
        ctx.config.conflict_retry_limit,
    )
    .await?;
    ctx.forget(key);
    info!("🗑️  Finalized");
    Ok(Action::await_change())
}

async fn destroy(ctx: &Reconciler, key: &ObjectKey, tf: &Terraform) -> Result<(), ReconcilerError> {
    let now = Utc::now();
    let tf = enter_locked_phase(ctx, key, now, |_, status| {
        status.phase = Some(Phase::Destroying);
    })
    .await?;

    let SourceState::Ready(artifact) = ctx.collaborators.sources.resolve(&tf).await? else {
        return Err(ReconcilerError::Transient(
            "source not ready, cannot destroy resources".to_string(),
        ));
    };
    let inventory = tf
        .status
        .as_ref()
        .and_then(|status| status.inventory.clone())
        .unwrap_or_default();
    info!(resources = inventory.entries.len(), "💥 Destroying managed resources");

    let runner = ctx.collaborators.runners.ensure(&tf).await?;
    let session = ctx.collaborators.sessions.connect(&runner).await?;
    let request = init_request(ctx.collaborators.secrets.as_ref(), &tf, &artifact).await?;
    session.init(&request).await?;
    session
        .destroy(&DestroyRequest {
            inventory: inventory.entries,
            targets: tf.spec.targets.clone(),
        })
        .await?;
    observability::metrics::increment_destroys();

    patch_status(
        ctx.collaborators.store.as_ref(),
        key,
        ctx.config.conflict_retry_limit,
        |_, status| {
            status.inventory = None;
            status.available_outputs.clear();
            status.plan = None;
            status.failure_count = 0;
            status.retry_after = None;
            status.last_applied_revision = None;
            lock::release(status);
        },
    )
    .await?;
    info!("Destroy complete");
    Ok(())
}
