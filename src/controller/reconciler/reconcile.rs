//! # Reconcile
//!
//! The tick driver: reads the freshest object, asks `phase` for a decision
//! and carries it out through the runner, the execution session, the webhook
//! gate and the status store.
//!
//! Every transition is persisted with `patch_status`. Lock acquisition and
//! release ride in the same patch as the phase change they belong to.

use crate::constants::FINALIZER;
use crate::controller::dependency;
use crate::controller::lock::{self, ForceUnlock};
use crate::controller::reconciler::finalize;
use crate::controller::reconciler::inputs::{init_request, outputs_document, select_outputs};
use crate::controller::reconciler::phase::{
    decide, lifecycle_decision, next_plan_id, plan_approved, spec_fingerprint, Decision, Lifecycle,
    Observation, PlanTrigger, Schedule,
};
use crate::controller::reconciler::status::{
    set_condition, set_ready, settled_phase, timestamp, STATUS_FALSE, STATUS_TRUE, STATUS_UNKNOWN,
};
use crate::controller::reconciler::types::{Reconciler, ReconcilerError};
use crate::controller::reconciler::validation::{parse_kubernetes_duration, validate_terraform};
use crate::controller::runner::RunnerHandle;
use crate::controller::session::{
    ApplyRequest, ExecutionSession, OutputValue, PlanRequest, PlanResult, SessionError,
};
use crate::controller::source::{SourceArtifact, SourceState};
use crate::controller::store::{ensure_finalizer, patch_status, ObjectKey, StatusStore, StoreError};
use crate::controller::webhook::{GateDecision, PlanPayload};
use crate::crd::{
    Phase, PlanStatus, ReadablePlanFormat, ResourceInventory, RunnerPodRef, Terraform,
    TerraformStatus, WebhookStage, CONDITION_APPLY, CONDITION_DRIFTED, CONDITION_HEALTHY,
    CONDITION_OUTPUT, CONDITION_PLAN, CONDITION_STATE_LOCKED,
};
use crate::observability;
use chrono::{DateTime, Utc};
use kube::ResourceExt;
use kube_runtime::controller::Action;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn, Instrument};

/// Requeue after a step that expects the next tick to continue at once
const CONTINUE: Duration = Duration::from_secs(1);

/// Reconcile one `Terraform` resource
///
/// Ticks of the same resource never overlap. The watched object is only a
/// trigger; every tick starts from a fresh read.
pub async fn reconcile(tf: Arc<Terraform>, ctx: Arc<Reconciler>) -> Result<Action, ReconcilerError> {
    let key = ObjectKey::from_resource(&tf);
    let span = info_span!(
        "reconcile",
        resource.namespace = %key.namespace,
        resource.name = %key.name
    );
    async move {
        let tick_lock = ctx.tick_lock(&key);
        let _guard = tick_lock.lock().await;
        let start = Instant::now();
        observability::metrics::increment_reconciliations();

        let Some(current) = ctx.collaborators.store.get(&key).await? else {
            debug!("Resource no longer exists");
            ctx.forget(&key);
            return Ok(Action::await_change());
        };

        let result = match tick(&ctx, &key, &current).await {
            Ok(action) => Ok(action),
            Err(error) => fail(&ctx, &key, error).await,
        };
        observability::metrics::observe_reconciliation_duration(start.elapsed().as_secs_f64());
        result
    }
    .instrument(span)
    .await
}

async fn tick(ctx: &Reconciler, key: &ObjectKey, tf: &Terraform) -> Result<Action, ReconcilerError> {
    let config = &ctx.config;
    let store = ctx.collaborators.store.as_ref();
    let now = Utc::now();

    if let Some(lifecycle) = lifecycle_decision(tf, now, &config.instance_id, config.lock_liveness()) {
        observability::metrics::increment_decisions(lifecycle.name());
        debug!(decision = lifecycle.name(), "Lifecycle transition");
        return match lifecycle {
            Lifecycle::Finalize => finalize::finalize(ctx, key, tf).await,
            Lifecycle::Suspend => suspend(ctx, key).await,
            Lifecycle::WaitForRetry(wait) => {
                debug!(wait_secs = wait.as_secs(), "Waiting out retry delay");
                Ok(Action::requeue(wait))
            }
            Lifecycle::ForceUnlock(unlock) => force_unlock(ctx, key, tf, &unlock).await,
        };
    }

    let tf = ensure_finalizer(store, key, FINALIZER, config.conflict_retry_limit).await?;
    validate_terraform(&tf).map_err(|e| ReconcilerError::Invalid(e.to_string()))?;
    let schedule = Schedule::from_spec(&tf.spec)?;

    let source = ctx.collaborators.sources.resolve(&tf).await?;
    let initializing = tf
        .status
        .as_ref()
        .and_then(|status| status.phase)
        .is_none_or(|phase| phase == Phase::Initializing);
    let dependencies = if initializing {
        Some(dependency::is_ready(store, &tf).await?)
    } else {
        None
    };

    let decision = decide(
        &tf,
        &Observation {
            now,
            schedule: &schedule,
            source: &source,
            dependencies: dependencies.as_ref(),
        },
    );
    observability::metrics::increment_decisions(decision.name());
    debug!(decision = decision.name(), "Decided next transition");

    match decision {
        Decision::Blocked(reason) => {
            let condition_reason = match source {
                SourceState::NotReady(_) => "SourceNotReady",
                SourceState::Ready(_) => "DependencyNotReady",
            };
            blocked(ctx, key, condition_reason, &reason).await
        }
        Decision::Idle(wait) => idle(ctx, key, wait).await,
        Decision::AwaitApproval => await_approval(ctx, key, &schedule).await,
        Decision::Apply => apply(ctx, key, &tf, &schedule, None).await,
        Decision::Plan {
            trigger,
            drift_only,
        } => match &source {
            SourceState::Ready(artifact) => {
                plan(ctx, key, &tf, &schedule, artifact, trigger, drift_only).await
            }
            SourceState::NotReady(reason) => blocked(ctx, key, "SourceNotReady", reason).await,
        },
    }
}

/// Cancels long-running steps when the module is deleted or suspended
///
/// Polls the store while the guarded future runs. Apply and destroy are never
/// guarded: interrupting them would leave state half-written.
#[allow(missing_debug_implementations, reason = "holds a trait object store")]
pub struct CancelWatch<'a> {
    store: &'a dyn StatusStore,
    key: &'a ObjectKey,
    poll: Duration,
}

impl<'a> CancelWatch<'a> {
    pub fn new(store: &'a dyn StatusStore, key: &'a ObjectKey, poll: Duration) -> Self {
        Self { store, key, poll }
    }

    async fn cancelled(&self) -> String {
        loop {
            tokio::time::sleep(self.poll).await;
            match self.store.get(self.key).await {
                Ok(None) => return "resource deleted".to_string(),
                Ok(Some(tf)) if tf.metadata.deletion_timestamp.is_some() => {
                    return "resource is being deleted".to_string()
                }
                Ok(Some(tf)) if tf.spec.suspend => return "resource suspended".to_string(),
                Ok(Some(_)) => {}
                Err(e) => debug!(error = %e, "Cancellation poll failed"),
            }
        }
    }

    /// Run `operation` unless the module goes away first
    pub async fn guard<T, E, F>(&self, operation: F) -> Result<T, ReconcilerError>
    where
        F: Future<Output = Result<T, E>>,
        ReconcilerError: From<E>,
    {
        tokio::select! {
            result = operation => result.map_err(ReconcilerError::from),
            reason = self.cancelled() => Err(ReconcilerError::Cancelled(reason)),
        }
    }
}

fn clear_failure(status: &mut TerraformStatus) {
    status.failure_count = 0;
    status.retry_after = None;
}

fn clear_pending_plan(status: &mut TerraformStatus) {
    if let Some(plan) = status.plan.as_mut() {
        plan.pending = None;
        plan.runner_pod = None;
        plan.spec_fingerprint = None;
        plan.is_destroy_plan = false;
        plan.is_drift_detection_only = false;
    }
}

fn mark_request_handled(tf: &Terraform, status: &mut TerraformStatus) {
    if let Some(requested) = tf.reconcile_request() {
        status.last_handled_reconcile_at = Some(requested.to_string());
    }
}

fn clear_state_locked(status: &mut TerraformStatus, generation: Option<i64>, now: DateTime<Utc>) {
    if status.condition(CONDITION_STATE_LOCKED).is_some() {
        set_condition(
            status,
            CONDITION_STATE_LOCKED,
            STATUS_FALSE,
            "Unlocked",
            "State lock released",
            generation,
            now,
        );
    }
}

/// Bookkeeping shared by every completed plan
fn record_plan(
    tf: &Terraform,
    status: &mut TerraformStatus,
    artifact: &SourceArtifact,
    fingerprint: &str,
    drift_only: bool,
    now: DateTime<Utc>,
) {
    let at = timestamp(now);
    status.observed_generation = tf.metadata.generation;
    status.last_plan_at = Some(at.clone());
    status.last_planned_revision = Some(artifact.revision.clone());
    status.last_plan_fingerprint = Some(fingerprint.to_string());
    if drift_only {
        status.last_drift_check_at = Some(at);
    }
    status.blocking_reason = None;
    mark_request_handled(tf, status);
}

fn failure_retry_interval(tf: &Terraform) -> Duration {
    parse_kubernetes_duration(tf.spec.retry_interval_or_default())
        .or_else(|_| parse_kubernetes_duration(crate::constants::DEFAULT_RETRY_INTERVAL))
        .unwrap_or(Duration::from_secs(15))
}

async fn cleanup_runner(ctx: &Reconciler, tf: &Terraform) {
    if !tf.spec.cleanup_runner_pod() {
        return;
    }
    if let Err(e) = ctx.collaborators.runners.teardown(tf).await {
        warn!(error = %e, "Runner pod cleanup failed");
    }
}

/// Take the lock and enter `phase` in one patch
///
/// Fails with `Locked` when another holder owns a live lock.
pub(crate) async fn enter_locked_phase<F>(
    ctx: &Reconciler,
    key: &ObjectKey,
    now: DateTime<Utc>,
    mutate: F,
) -> Result<Terraform, ReconcilerError>
where
    F: Fn(&Terraform, &mut TerraformStatus),
{
    let config = &ctx.config;
    let updated = patch_status(
        ctx.collaborators.store.as_ref(),
        key,
        config.conflict_retry_limit,
        |tf, status| {
            if lock::try_acquire(status, &config.instance_id, now, config.lock_liveness()) {
                mutate(tf, status);
            }
        },
    )
    .await?;
    let status = updated.status.clone().unwrap_or_default();
    if !lock::is_held_by(&status, &config.instance_id) {
        observability::metrics::increment_lock_contention();
        let holder = status
            .lock
            .and_then(|lock| lock.holder)
            .unwrap_or_default();
        return Err(ReconcilerError::Locked { holder });
    }
    Ok(updated)
}

async fn blocked(
    ctx: &Reconciler,
    key: &ObjectKey,
    condition_reason: &str,
    reason: &str,
) -> Result<Action, ReconcilerError> {
    let now = Utc::now();
    info!(reason, "Waiting on source or dependencies");
    patch_status(
        ctx.collaborators.store.as_ref(),
        key,
        ctx.config.conflict_retry_limit,
        |tf, status| {
            if status.phase.is_none() {
                status.phase = Some(Phase::Initializing);
            }
            status.observed_generation = tf.metadata.generation;
            status.blocking_reason = Some(reason.to_string());
            set_ready(
                status,
                STATUS_FALSE,
                condition_reason,
                reason,
                tf.metadata.generation,
                now,
            );
        },
    )
    .await?;
    observability::metrics::increment_requeues_total("blocked");
    Ok(Action::requeue(ctx.config.dependency_requeue()))
}

async fn idle(ctx: &Reconciler, key: &ObjectKey, wait: Duration) -> Result<Action, ReconcilerError> {
    let now = Utc::now();
    patch_status(
        ctx.collaborators.store.as_ref(),
        key,
        ctx.config.conflict_retry_limit,
        |tf, status| {
            let was_blocked = status.blocking_reason.take().is_some();
            let resumed = matches!(status.phase, None | Some(Phase::Suspended));
            if resumed || was_blocked {
                status.phase = Some(settled_phase(status));
                if status.phase == Some(Phase::Applied) {
                    set_ready(
                        status,
                        STATUS_TRUE,
                        "Applied",
                        format!(
                            "Applied revision: {}",
                            status.last_applied_revision.clone().unwrap_or_default()
                        ),
                        tf.metadata.generation,
                        now,
                    );
                }
            }
        },
    )
    .await?;
    debug!(wait_secs = wait.as_secs(), "Nothing to do until the next check");
    observability::metrics::increment_requeues_total("interval");
    Ok(Action::requeue(wait))
}

async fn suspend(ctx: &Reconciler, key: &ObjectKey) -> Result<Action, ReconcilerError> {
    let now = Utc::now();
    patch_status(
        ctx.collaborators.store.as_ref(),
        key,
        ctx.config.conflict_retry_limit,
        |tf, status| {
            status.phase = Some(Phase::Suspended);
            status.observed_generation = tf.metadata.generation;
            lock::release(status);
            set_ready(
                status,
                STATUS_FALSE,
                "Suspended",
                "Reconciliation is suspended",
                tf.metadata.generation,
                now,
            );
        },
    )
    .await?;
    info!("⏸️  Reconciliation suspended");
    Ok(Action::await_change())
}

async fn force_unlock(
    ctx: &Reconciler,
    key: &ObjectKey,
    tf: &Terraform,
    unlock: &ForceUnlock,
) -> Result<Action, ReconcilerError> {
    let backend_lock = match unlock {
        ForceUnlock::LockId(id) => Some(id.clone()),
        ForceUnlock::Auto => tf
            .status
            .as_ref()
            .and_then(|status| status.lock.as_ref())
            .and_then(|lock| lock.pending.clone())
            .filter(|id| !id.is_empty()),
    };

    if let Some(lock_id) = &backend_lock {
        let SourceState::Ready(artifact) = ctx.collaborators.sources.resolve(tf).await? else {
            return Err(ReconcilerError::Transient(
                "source not ready, cannot prepare force-unlock".to_string(),
            ));
        };
        info!(lock_id = %lock_id, "🔓 Force-unlocking state");
        let runner = ctx.collaborators.runners.ensure(tf).await?;
        let session = ctx.collaborators.sessions.connect(&runner).await?;
        let request = init_request(ctx.collaborators.secrets.as_ref(), tf, &artifact).await?;
        session.init(&request).await?;
        session.force_unlock(lock_id).await?;
    }

    let now = Utc::now();
    patch_status(
        ctx.collaborators.store.as_ref(),
        key,
        ctx.config.conflict_retry_limit,
        |tf, status| {
            lock::record_force_unlock(status, unlock);
            status.retry_after = None;
            status.observed_generation = tf.metadata.generation;
            set_condition(
                status,
                CONDITION_STATE_LOCKED,
                STATUS_FALSE,
                "ForceUnlocked",
                match &backend_lock {
                    Some(id) => format!("Lock {id} was force-unlocked"),
                    None => "Stale lock holder was cleared".to_string(),
                },
                tf.metadata.generation,
                now,
            );
        },
    )
    .await?;
    Ok(Action::requeue(CONTINUE))
}

async fn await_approval(
    ctx: &Reconciler,
    key: &ObjectKey,
    schedule: &Schedule,
) -> Result<Action, ReconcilerError> {
    let config = &ctx.config;
    let now = Utc::now();
    patch_status(
        ctx.collaborators.store.as_ref(),
        key,
        config.conflict_retry_limit,
        |tf, status| {
            if lock::refresh_due(status, &config.instance_id, now, config.lock_liveness()) {
                lock::try_acquire(status, &config.instance_id, now, config.lock_liveness());
            }
            let plan = status.plan.clone().unwrap_or_default();
            let pending = plan.pending_id().unwrap_or_default().to_string();
            status.observed_generation = tf.metadata.generation;
            status.blocking_reason = None;
            mark_request_handled(tf, status);
            if plan.is_drift_detection_only {
                status.phase = Some(Phase::Drifted);
                set_ready(
                    status,
                    STATUS_FALSE,
                    "DriftDetected",
                    format!("Drift detected: set approvePlan: \"{pending}\" to correct it."),
                    tf.metadata.generation,
                    now,
                );
            } else {
                status.phase = Some(Phase::AwaitingApproval);
                set_ready(
                    status,
                    STATUS_FALSE,
                    "ApprovalRequired",
                    format!("Plan generated: set approvePlan: \"{pending}\" to approve this plan."),
                    tf.metadata.generation,
                    now,
                );
            }
        },
    )
    .await?;
    observability::metrics::increment_requeues_total("awaiting-approval");
    Ok(Action::requeue(
        schedule.interval.min(config.lock_liveness() / 2).max(CONTINUE),
    ))
}

fn readable_plan(format: ReadablePlanFormat, result: &PlanResult) -> Option<String> {
    match format {
        ReadablePlanFormat::None => None,
        ReadablePlanFormat::Human => Some(result.diff.clone()),
        ReadablePlanFormat::Json => Some(
            result
                .json
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default(),
        ),
    }
}

#[allow(clippy::too_many_arguments)]
async fn plan(
    ctx: &Reconciler,
    key: &ObjectKey,
    tf: &Terraform,
    schedule: &Schedule,
    artifact: &SourceArtifact,
    trigger: PlanTrigger,
    drift_only: bool,
) -> Result<Action, ReconcilerError> {
    let config = &ctx.config;
    let store = ctx.collaborators.store.as_ref();
    let now = Utc::now();
    info!(
        trigger = trigger.as_str(),
        drift_only,
        revision = %artifact.revision,
        "📋 Planning"
    );

    let previous = tf.status.as_ref().and_then(|status| status.plan.clone());
    let plan_id = next_plan_id(&artifact.short_revision(), previous.as_ref());

    let tf = enter_locked_phase(ctx, key, now, |tf, status| {
        status.phase = Some(Phase::Planning);
        status.observed_generation = tf.metadata.generation;
        status.last_attempted_revision = Some(artifact.revision.clone());
        status.blocking_reason = None;
        clear_pending_plan(status);
        set_condition(
            status,
            CONDITION_PLAN,
            STATUS_UNKNOWN,
            "Planning",
            format!("Planning revision {}", artifact.short_revision()),
            tf.metadata.generation,
            now,
        );
    })
    .await?;
    let fingerprint = spec_fingerprint(&tf.spec);

    let cancel = CancelWatch::new(store, key, config.cancel_poll_interval());
    let runner = cancel.guard(ctx.collaborators.runners.ensure(&tf)).await?;
    let session = cancel.guard(ctx.collaborators.sessions.connect(&runner)).await?;
    let request = init_request(ctx.collaborators.secrets.as_ref(), &tf, artifact).await?;
    cancel.guard(session.init(&request)).await?;

    let result = cancel
        .guard(session.plan(&PlanRequest {
            plan_id: plan_id.clone(),
            destroy: tf.spec.destroy,
            drift_detection_only: drift_only,
            targets: tf.spec.targets.clone(),
            parallelism: tf.spec.parallelism,
            refresh: true,
        }))
        .await?;
    let plan_id = if result.plan_id.is_empty() {
        plan_id
    } else {
        result.plan_id.clone()
    };

    if !result.has_changes {
        observability::metrics::increment_plans("no-changes");
        return plan_without_changes(
            ctx, key, &tf, schedule, artifact, &fingerprint, drift_only, &result, session.as_ref(),
            &cancel,
        )
        .await;
    }
    observability::metrics::increment_plans("changes");
    if drift_only {
        observability::metrics::increment_drift_detected();
        warn!(plan = %plan_id, "Drift detected");
    }

    let payload = PlanPayload {
        plan_id: plan_id.clone(),
        is_destroy: result.is_destroy,
        is_drift_detection_only: drift_only,
        revision: artifact.revision.clone(),
        diff: result.diff.clone(),
        json: result.json.clone(),
    };
    let verdict = cancel
        .guard(async {
            Ok::<_, ReconcilerError>(
                ctx.collaborators
                    .webhooks
                    .evaluate(&tf, WebhookStage::PostPlanning, &payload)
                    .await,
            )
        })
        .await?;
    if let GateDecision::Deny { reason, retry } = verdict {
        return Err(ReconcilerError::PolicyDenied { reason, retry });
    }

    if let Some(content) = readable_plan(tf.spec.store_readable_plan, &result) {
        if let Err(e) = ctx
            .collaborators
            .secrets
            .write_readable_plan(&tf, &plan_id, &content)
            .await
        {
            warn!(error = %e, "Failed to store readable plan");
        }
    }

    let persisted = patch_status(store, key, config.conflict_retry_limit, |current, status| {
        let last_applied = status.plan.as_ref().and_then(|p| p.last_applied.clone());
        status.plan = Some(PlanStatus {
            pending: Some(plan_id.clone()),
            is_destroy_plan: result.is_destroy,
            is_drift_detection_only: drift_only,
            last_applied,
            runner_pod: Some(RunnerPodRef {
                name: runner.pod_name.clone(),
                uid: runner.uid.clone(),
            }),
            spec_fingerprint: Some(fingerprint.clone()),
        });
        record_plan(current, status, artifact, &fingerprint, drift_only, now);
        clear_failure(status);
        clear_state_locked(status, current.metadata.generation, now);
        status.phase = Some(if drift_only {
            Phase::Drifted
        } else {
            Phase::AwaitingApproval
        });
        set_condition(
            status,
            CONDITION_PLAN,
            STATUS_TRUE,
            "PlanGenerated",
            format!("Plan generated: {plan_id}"),
            current.metadata.generation,
            now,
        );
        if drift_only {
            status.last_drift_detected_at = Some(timestamp(now));
            set_condition(
                status,
                CONDITION_DRIFTED,
                STATUS_TRUE,
                "DriftDetected",
                format!("Drift detected: {plan_id}"),
                current.metadata.generation,
                now,
            );
        }
    })
    .await?;
    ctx.reset_backoff(key);
    info!(plan = %plan_id, destroy = result.is_destroy, "Plan generated");

    let pending = persisted
        .status
        .as_ref()
        .and_then(|status| status.plan.clone())
        .unwrap_or_default();
    if plan_approved(&persisted, &pending) {
        return apply(ctx, key, &persisted, schedule, Some((runner, session))).await;
    }
    await_approval(ctx, key, schedule).await
}

#[allow(clippy::too_many_arguments)]
async fn plan_without_changes(
    ctx: &Reconciler,
    key: &ObjectKey,
    tf: &Terraform,
    schedule: &Schedule,
    artifact: &SourceArtifact,
    fingerprint: &str,
    drift_only: bool,
    result: &PlanResult,
    session: &dyn ExecutionSession,
    cancel: &CancelWatch<'_>,
) -> Result<Action, ReconcilerError> {
    let now = Utc::now();
    // Outputs and health are refreshed on quiet plans too, so a failed write heals
    let post = if result.is_destroy
        || (tf.spec.write_outputs_to_secret.is_none() && tf.spec.health_checks.is_empty())
    {
        PostApply::default()
    } else {
        let outputs = cancel.guard(session.output()).await?;
        post_apply(ctx, tf, &outputs, false).await
    };
    let retry_interval = failure_retry_interval(tf);

    let updated = patch_status(
        ctx.collaborators.store.as_ref(),
        key,
        ctx.config.conflict_retry_limit,
        |current, status| {
            let generation = current.metadata.generation;
            clear_pending_plan(status);
            record_plan(current, status, artifact, fingerprint, drift_only, now);
            clear_failure(status);
            lock::release(status);
            clear_state_locked(status, generation, now);
            status.phase = Some(Phase::Applied);
            status.last_applied_revision = Some(artifact.revision.clone());
            if result.is_destroy {
                status.inventory = None;
                status.available_outputs.clear();
            }
            set_condition(
                status,
                CONDITION_PLAN,
                STATUS_FALSE,
                "NoChanges",
                "Plan no changes",
                generation,
                now,
            );
            if drift_only {
                set_condition(
                    status,
                    CONDITION_DRIFTED,
                    STATUS_FALSE,
                    "NoDrift",
                    "No drift detected",
                    generation,
                    now,
                );
            }
            match post.record(status, generation, now) {
                None => set_ready(
                    status,
                    STATUS_TRUE,
                    "NoChanges",
                    format!("Plan no changes, revision: {}", artifact.revision),
                    generation,
                    now,
                ),
                Some((reason, message)) => {
                    set_ready(status, STATUS_FALSE, reason, message, generation, now);
                    status.failure_count = 1;
                    status.retry_after = Some(timestamp(now + chrono_duration(retry_interval)));
                }
            }
        },
    )
    .await?;
    ctx.reset_backoff(key);
    cleanup_runner(ctx, &updated).await;
    info!(revision = %artifact.revision, drift_only, "✅ Plan has no changes");

    if post.failed() {
        return Ok(Action::requeue(retry_interval));
    }
    observability::metrics::increment_requeues_total("interval");
    Ok(Action::requeue(schedule.next_check()))
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// Outcome of the steps that follow a successful apply
#[derive(Debug, Default)]
struct PostApply {
    /// Name of the outputs secret written, or why writing failed
    outputs: Option<Result<String, String>>,
    health: Option<Result<(), String>>,
}

impl PostApply {
    fn failed(&self) -> bool {
        matches!(self.outputs, Some(Err(_))) || matches!(self.health, Some(Err(_)))
    }

    /// Write the Output and HealthCheck conditions; returns the first problem
    fn record(
        &self,
        status: &mut TerraformStatus,
        generation: Option<i64>,
        now: DateTime<Utc>,
    ) -> Option<(&'static str, String)> {
        let mut problem = None;
        match &self.outputs {
            Some(Ok(name)) => set_condition(
                status,
                CONDITION_OUTPUT,
                STATUS_TRUE,
                "OutputsWritten",
                format!("Outputs written to secret {name}"),
                generation,
                now,
            ),
            Some(Err(message)) => {
                set_condition(
                    status,
                    CONDITION_OUTPUT,
                    STATUS_FALSE,
                    "OutputsWritingFailed",
                    message.clone(),
                    generation,
                    now,
                );
                problem = Some(("OutputsWritingFailed", message.clone()));
            }
            None => {}
        }
        match &self.health {
            Some(Ok(())) => set_condition(
                status,
                CONDITION_HEALTHY,
                STATUS_TRUE,
                "HealthChecksPassed",
                "Health checks passed",
                generation,
                now,
            ),
            Some(Err(message)) => {
                set_condition(
                    status,
                    CONDITION_HEALTHY,
                    STATUS_FALSE,
                    "HealthChecksFailed",
                    message.clone(),
                    generation,
                    now,
                );
                problem = problem.or(Some(("HealthChecksFailed", message.clone())));
            }
            None => {}
        }
        problem
    }
}

async fn post_apply(
    ctx: &Reconciler,
    tf: &Terraform,
    outputs: &BTreeMap<String, OutputValue>,
    destroyed: bool,
) -> PostApply {
    let namespace = tf.namespace().unwrap_or_default();
    let written = match &tf.spec.write_outputs_to_secret {
        Some(spec) if destroyed => {
            if let Err(e) = ctx.collaborators.secrets.delete_outputs(&namespace, &spec.name).await {
                warn!(error = %e, secret = %spec.name, "Failed to delete outputs secret");
            }
            None
        }
        Some(spec) => Some(
            ctx.collaborators
                .secrets
                .write_outputs(tf, spec, select_outputs(outputs, spec))
                .await
                .map(|()| spec.name.clone())
                .map_err(|e| e.to_string()),
        ),
        None => None,
    };
    let health = if destroyed || tf.spec.health_checks.is_empty() {
        None
    } else {
        Some(
            ctx.collaborators
                .health
                .check(&tf.spec.health_checks, &outputs_document(outputs))
                .await,
        )
    };
    PostApply {
        outputs: written,
        health,
    }
}

async fn apply(
    ctx: &Reconciler,
    key: &ObjectKey,
    tf: &Terraform,
    schedule: &Schedule,
    live: Option<(RunnerHandle, Box<dyn ExecutionSession>)>,
) -> Result<Action, ReconcilerError> {
    let plan = tf
        .status
        .as_ref()
        .and_then(|status| status.plan.clone())
        .unwrap_or_default();
    let Some(plan_id) = plan.pending_id().map(str::to_string) else {
        return Ok(Action::requeue(CONTINUE));
    };

    let (runner, session) = match live {
        Some(live) => live,
        None => {
            let runner = ctx
                .collaborators
                .runners
                .lookup(tf)
                .await?
                .ok_or_else(|| {
                    ReconcilerError::SessionUnavailable(format!(
                        "runner holding plan {plan_id} is gone"
                    ))
                })?;
            if plan
                .runner_pod
                .as_ref()
                .is_some_and(|pod| pod.uid != runner.uid)
            {
                return Err(ReconcilerError::SessionUnavailable(format!(
                    "runner pod {} was replaced after plan {plan_id} was computed",
                    runner.pod_name
                )));
            }
            let session = ctx.collaborators.sessions.connect(&runner).await?;
            (runner, session)
        }
    };

    let now = Utc::now();
    enter_locked_phase(ctx, key, now, |tf, status| {
        status.phase = Some(Phase::Applying);
        status.observed_generation = tf.metadata.generation;
        set_condition(
            status,
            CONDITION_APPLY,
            STATUS_UNKNOWN,
            "Applying",
            format!("Applying plan {plan_id}"),
            tf.metadata.generation,
            now,
        );
    })
    .await?;
    info!(plan = %plan_id, runner = %runner.pod_name, destroy = plan.is_destroy_plan, "🚀 Applying plan");

    let result = session
        .apply(&ApplyRequest {
            plan_id: plan_id.clone(),
            parallelism: tf.spec.parallelism,
            refresh_before_apply: tf.spec.refresh_before_apply,
        })
        .await
        .map_err(|e| match e {
            // The runner may still be applying
            SessionError::Timeout(_) | SessionError::Unavailable(_) => {
                ReconcilerError::ApplyInterrupted(e.to_string())
            }
            other => ReconcilerError::from(other),
        })?;
    observability::metrics::increment_applies();

    let post = post_apply(ctx, tf, &result.outputs, plan.is_destroy_plan).await;
    let retry_interval = failure_retry_interval(tf);
    let now = Utc::now();
    let updated = patch_status(
        ctx.collaborators.store.as_ref(),
        key,
        ctx.config.conflict_retry_limit,
        |current, status| {
            let generation = current.metadata.generation;
            let drift_correction = status
                .plan
                .as_ref()
                .is_some_and(|p| p.is_drift_detection_only);
            clear_pending_plan(status);
            if let Some(plan) = status.plan.as_mut() {
                plan.last_applied = Some(plan_id.clone());
            }
            clear_failure(status);
            lock::release(status);
            clear_state_locked(status, generation, now);
            status.phase = Some(Phase::Applied);
            status.observed_generation = generation;
            status.inventory = (!result.inventory.is_empty()).then(|| ResourceInventory {
                entries: result.inventory.clone(),
            });
            status.available_outputs = result.outputs.keys().cloned().collect();
            status.last_applied_revision = status.last_planned_revision.clone();
            status.last_applied_generation = generation;
            mark_request_handled(current, status);
            if drift_correction {
                status.last_applied_by_drift_detection_at = Some(timestamp(now));
                set_condition(
                    status,
                    CONDITION_DRIFTED,
                    STATUS_FALSE,
                    "DriftCorrected",
                    format!("Drift corrected by plan {plan_id}"),
                    generation,
                    now,
                );
            }
            set_condition(
                status,
                CONDITION_APPLY,
                STATUS_TRUE,
                "ApplySucceeded",
                format!("Applied successfully: {plan_id}"),
                generation,
                now,
            );
            match post.record(status, generation, now) {
                None => set_ready(
                    status,
                    STATUS_TRUE,
                    "Applied",
                    format!(
                        "Applied revision: {}",
                        status.last_applied_revision.clone().unwrap_or_default()
                    ),
                    generation,
                    now,
                ),
                Some((reason, message)) => {
                    set_ready(status, STATUS_FALSE, reason, message, generation, now);
                    status.failure_count = 1;
                    status.retry_after = Some(timestamp(now + chrono_duration(retry_interval)));
                }
            }
        },
    )
    .await?;
    ctx.reset_backoff(key);
    cleanup_runner(ctx, &updated).await;
    info!(plan = %plan_id, resources = result.inventory.len(), "✅ Apply complete");

    if post.failed() {
        return Ok(Action::requeue(retry_interval));
    }
    observability::metrics::increment_requeues_total("interval");
    Ok(Action::requeue(schedule.next_check()))
}

/// Record a failed tick and schedule the retry
///
/// Transient failures back off exponentially and only surface as `Failed`
/// once they repeat `transient_failure_threshold` times. Semantic failures
/// surface at once and wait `retryInterval`. Store failures cannot be
/// recorded in status and go to the error policy instead. An interrupted
/// apply keeps its runner, its lock and the pending plan.
pub(crate) async fn fail(
    ctx: &Reconciler,
    key: &ObjectKey,
    error: ReconcilerError,
) -> Result<Action, ReconcilerError> {
    let config = &ctx.config;
    let store = ctx.collaborators.store.as_ref();
    observability::metrics::increment_reconciliation_errors(error.reason());

    match &error {
        ReconcilerError::Store(StoreError::NotFound(_)) => {
            debug!("Resource deleted mid-tick");
            ctx.forget(key);
            return Ok(Action::await_change());
        }
        ReconcilerError::Store(_) | ReconcilerError::Conflict(_) => return Err(error),
        ReconcilerError::Cancelled(reason) => {
            info!(reason = %reason, "Execution cancelled");
            match patch_status(store, key, config.conflict_retry_limit, |_, status| {
                lock::release(status);
                if matches!(status.phase, Some(Phase::Planning)) {
                    status.phase = Some(settled_phase(status));
                }
            })
            .await
            {
                Ok(_) | Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
            return Ok(Action::requeue(CONTINUE));
        }
        _ => {}
    }

    let transient = error.is_transient();
    let threshold = config.transient_failure_threshold.max(1);
    let backoff = config.backoff();
    let delay_for = |tf: &Terraform, failures: u32| {
        if transient {
            backoff.delay(failures)
        } else {
            failure_retry_interval(tf)
        }
    };
    let reason = error.reason();
    let message = error.to_string();
    let lock_info = match &error {
        ReconcilerError::ExecutionFailed { lock, .. } => lock.clone(),
        _ => None,
    };
    let locked_by = match &error {
        ReconcilerError::Locked { holder } => Some(holder.clone()),
        _ => None,
    };
    let apply_in_flight = matches!(error, ReconcilerError::ApplyInterrupted(_));
    let now = Utc::now();

    let updated = match patch_status(store, key, config.conflict_retry_limit, |tf, status| {
        let generation = tf.metadata.generation;
        let failures = status.failure_count.saturating_add(1);
        let surfaced = !transient || failures >= threshold;
        status.failure_count = failures;
        status.retry_after = Some(timestamp(now + chrono_duration(delay_for(tf, failures))));
        status.observed_generation = generation;

        match status.phase {
            Some(Phase::Planning) => set_condition(
                status,
                CONDITION_PLAN,
                STATUS_FALSE,
                "PlanFailed",
                message.clone(),
                generation,
                now,
            ),
            Some(Phase::Applying) if !apply_in_flight => set_condition(
                status,
                CONDITION_APPLY,
                STATUS_FALSE,
                "ApplyFailed",
                message.clone(),
                generation,
                now,
            ),
            _ => {}
        }

        if let Some(holder) = &locked_by {
            set_condition(
                status,
                CONDITION_STATE_LOCKED,
                STATUS_TRUE,
                "StateLocked",
                format!("State lock held by '{holder}'"),
                generation,
                now,
            );
        } else if !apply_in_flight {
            lock::release(status);
            clear_pending_plan(status);
        }
        if let Some(info) = &lock_info {
            lock::record_foreign_lock(status, &info.id);
            set_condition(
                status,
                CONDITION_STATE_LOCKED,
                STATUS_TRUE,
                "StateLocked",
                format!(
                    "State locked by {} (lock ID {}); set backendConfig.state.forceUnlock to release it",
                    info.who.as_deref().unwrap_or("unknown"),
                    info.id
                ),
                generation,
                now,
            );
        }

        if surfaced {
            status.phase = Some(Phase::Failed);
            set_ready(status, STATUS_FALSE, reason, message.clone(), generation, now);
        } else if apply_in_flight {
            set_ready(status, STATUS_FALSE, reason, message.clone(), generation, now);
        } else if matches!(
            status.phase,
            Some(
                Phase::Planning
                    | Phase::Applying
                    | Phase::Destroying
                    | Phase::AwaitingApproval
                    | Phase::Drifted
            )
        ) {
            // The pending plan may have been dropped above
            status.phase = Some(settled_phase(status));
        }
    })
    .await
    {
        Ok(updated) => updated,
        Err(StoreError::NotFound(_)) => {
            ctx.forget(key);
            return Ok(Action::await_change());
        }
        Err(e) => {
            warn!(error = %e, original = %message, "Failed to record failure in status");
            return Err(error);
        }
    };

    let failures = updated.status.as_ref().map_or(1, |s| s.failure_count);
    let delay = delay_for(&updated, failures);
    if transient && failures < threshold {
        info!(
            error = %message,
            failures,
            retry_in_secs = delay.as_secs(),
            "🔄 Transient failure, retrying with backoff"
        );
    } else {
        warn!(
            error = %message,
            reason,
            failures,
            retry_in_secs = delay.as_secs(),
            "❌ Reconciliation failed"
        );
    }

    if locked_by.is_none() && !apply_in_flight {
        cleanup_runner(ctx, &updated).await;
    }
    observability::metrics::increment_requeues_total(if transient {
        "error-backoff"
    } else {
        "retry-interval"
    });
    Ok(Action::requeue(delay))
}
