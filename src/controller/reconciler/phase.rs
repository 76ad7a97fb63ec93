//! # Phase Decisions
//!
//! Pure functions deciding the next transition of a module from its object
//! and the observed world. No I/O happens here; the driver in `reconcile`
//! gathers the observation and carries out the decision.

use crate::controller::dependency::Readiness;
use crate::controller::lock::{pending_force_unlock, ForceUnlock};
use crate::controller::reconciler::status::{parse_timestamp, remaining};
use crate::controller::reconciler::types::ReconcilerError;
use crate::controller::reconciler::validation::parse_kubernetes_duration;
use crate::controller::source::SourceState;
use crate::crd::{ApprovalMode, PlanStatus, Terraform, TerraformSpec};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::time::Duration;

const MIN_IDLE_REQUEUE: Duration = Duration::from_secs(1);

/// Parsed timing settings of a module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    pub interval: Duration,
    pub retry_interval: Duration,
    /// `None` when drift detection is disabled
    pub drift_interval: Option<Duration>,
}

impl Schedule {
    pub fn from_spec(spec: &TerraformSpec) -> Result<Self, ReconcilerError> {
        let parse = |field: &str, value: &str| {
            parse_kubernetes_duration(value)
                .map_err(|e| ReconcilerError::Invalid(format!("{field}: {e}")))
        };
        let interval = parse("interval", &spec.interval)?;
        let retry_interval = parse("retryInterval", spec.retry_interval_or_default())?;
        let drift_interval = if spec.drift_detection_enabled() {
            match spec.drift_detection_interval.as_deref() {
                Some(value) => Some(parse("driftDetectionInterval", value)?),
                None => Some(interval),
            }
        } else {
            None
        };
        Ok(Self {
            interval,
            retry_interval,
            drift_interval,
        })
    }

    /// Delay until the next periodic plan, counted from a plan made now
    #[must_use]
    pub fn next_check(&self) -> Duration {
        self.drift_interval
            .map_or(self.interval, |drift| drift.min(self.interval))
            .max(MIN_IDLE_REQUEUE)
    }
}

/// Fingerprint of the spec fields that shape a plan
///
/// `approvePlan`, `suspend` and the force-unlock token do not change what a
/// plan would contain, so editing them does not make a pending plan stale.
#[must_use]
pub fn spec_fingerprint(spec: &TerraformSpec) -> String {
    let mut normalized = spec.clone();
    normalized.approve_plan.clear();
    normalized.suspend = false;
    if let Some(state) = normalized
        .backend_config
        .as_mut()
        .and_then(|backend| backend.state.as_mut())
    {
        state.force_unlock.clear();
    }
    let rendered = serde_json::to_value(&normalized).unwrap_or_default();
    let digest = Sha256::digest(rendered.to_string().as_bytes());
    digest
        .iter()
        .take(8)
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// Why a new plan is computed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanTrigger {
    FirstRun,
    SpecChanged,
    SourceChanged,
    ManualRequest,
    /// The previous attempt failed
    Retry,
    /// The pending plan no longer matches the spec or the source
    Stale,
    Drift,
    Interval,
}

impl PlanTrigger {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTrigger::FirstRun => "first-run",
            PlanTrigger::SpecChanged => "spec-changed",
            PlanTrigger::SourceChanged => "source-changed",
            PlanTrigger::ManualRequest => "manual-request",
            PlanTrigger::Retry => "retry",
            PlanTrigger::Stale => "stale-plan",
            PlanTrigger::Drift => "drift-check",
            PlanTrigger::Interval => "interval",
        }
    }
}

/// Transition that preempts planning: deletion, suspension, retry wait, force-unlock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lifecycle {
    /// Object is being deleted
    Finalize,
    Suspend,
    /// A previous failure asked to wait this long
    WaitForRetry(Duration),
    ForceUnlock(ForceUnlock),
}

impl Lifecycle {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Lifecycle::Finalize => "finalize",
            Lifecycle::Suspend => "suspend",
            Lifecycle::WaitForRetry(_) => "wait-for-retry",
            Lifecycle::ForceUnlock(_) => "force-unlock",
        }
    }
}

/// Next transition of a live, unsuspended module
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Source or dependencies not ready
    Blocked(String),
    Plan {
        trigger: PlanTrigger,
        drift_only: bool,
    },
    Apply,
    AwaitApproval,
    /// Nothing to do until the next interval or drift check
    Idle(Duration),
}

impl Decision {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Decision::Blocked(_) => "blocked",
            Decision::Plan { .. } => "plan",
            Decision::Apply => "apply",
            Decision::AwaitApproval => "await-approval",
            Decision::Idle(_) => "idle",
        }
    }
}

/// What the driver observed before deciding
#[derive(Debug, Clone)]
pub struct Observation<'a> {
    pub now: DateTime<Utc>,
    pub schedule: &'a Schedule,
    pub source: &'a SourceState,
    /// Only evaluated while the module is initializing
    pub dependencies: Option<&'a Readiness>,
}

/// Delay still owed to a previous failure, unless something new happened
///
/// A spec edit (generation bump) or a new reconcile request cuts the wait short.
#[must_use]
pub fn retry_wait(tf: &Terraform, now: DateTime<Utc>) -> Option<Duration> {
    let status = tf.status.as_ref()?;
    let retry_after = parse_timestamp(status.retry_after.as_deref())?;
    let wait = retry_after.signed_duration_since(now).to_std().ok()?;
    if wait.is_zero() {
        return None;
    }
    let spec_changed = status.observed_generation != tf.metadata.generation;
    if spec_changed || tf.has_new_reconcile_request() {
        return None;
    }
    Some(wait)
}

/// Decisions that take precedence over the source and the plan state
///
/// Evaluated before any network call: deletion, suspension, a pending retry
/// wait and force-unlock, in that order. A deleting object still honours the
/// retry wait so a failing destroy backs off, and acts on a force-unlock
/// before destroying.
#[must_use]
pub fn lifecycle_decision(
    tf: &Terraform,
    now: DateTime<Utc>,
    instance: &str,
    liveness: Duration,
) -> Option<Lifecycle> {
    let wait = retry_wait(tf, now);
    if tf.metadata.deletion_timestamp.is_some() {
        if let Some(wait) = wait {
            return Some(Lifecycle::WaitForRetry(wait));
        }
        // A stale lock would otherwise fail every destroy attempt
        return Some(
            pending_force_unlock(tf, instance, now, liveness)
                .map_or(Lifecycle::Finalize, Lifecycle::ForceUnlock),
        );
    }
    if tf.spec.suspend {
        return Some(Lifecycle::Suspend);
    }
    if let Some(wait) = wait {
        return Some(Lifecycle::WaitForRetry(wait));
    }
    pending_force_unlock(tf, instance, now, liveness).map(Lifecycle::ForceUnlock)
}

/// Name of the next plan computed at `short_revision`
///
/// The first plan of a revision is `plan-<short revision>`. Later plans of
/// the same revision get a `-N` suffix counted past the last applied and the
/// pending plan, so an approval never carries over to a plan it did not name.
#[must_use]
pub fn next_plan_id(short_revision: &str, previous: Option<&PlanStatus>) -> String {
    let base = format!("plan-{short_revision}");
    let sequence = |id: &str| -> u32 {
        if id == base {
            return 1;
        }
        id.strip_prefix(base.as_str())
            .and_then(|rest| rest.strip_prefix('-'))
            .and_then(|n| n.parse().ok())
            .unwrap_or(0)
    };
    let used = previous
        .map(|plan| {
            let applied = plan.last_applied.as_deref().map_or(0, sequence);
            let pending = plan.pending_id().map_or(0, sequence);
            applied.max(pending)
        })
        .unwrap_or(0);
    if used == 0 {
        base
    } else {
        format!("{base}-{}", used.saturating_add(1))
    }
}

/// Whether the pending plan may be applied without further input
///
/// Drift corrections follow `autoCorrectDrift`; an explicit approval of the
/// exact plan name always works. Other plans follow `approvePlan`. A name
/// that was already applied approves nothing.
#[must_use]
pub fn plan_approved(tf: &Terraform, plan: &PlanStatus) -> bool {
    let Some(pending) = plan.pending_id() else {
        return false;
    };
    if plan.last_applied.as_deref() == Some(pending) {
        return false;
    }
    if plan.is_drift_detection_only {
        return tf.spec.auto_correct_drift()
            || matches!(tf.spec.approval_mode(), ApprovalMode::Plan(name) if name == pending);
    }
    tf.spec.approval_mode().approves(pending)
}

/// Decide the next transition of a module that is neither deleting nor suspended
#[must_use]
pub fn decide(tf: &Terraform, observation: &Observation<'_>) -> Decision {
    let artifact = match observation.source {
        SourceState::Ready(artifact) => artifact,
        SourceState::NotReady(reason) => {
            return Decision::Blocked(format!("source not ready: {reason}"))
        }
    };
    if let Some(readiness) = observation.dependencies.filter(|r| !r.ready) {
        return Decision::Blocked(
            readiness
                .reason
                .clone()
                .unwrap_or_else(|| "dependencies not ready".to_string()),
        );
    }

    let status = tf.status.clone().unwrap_or_default();
    let fingerprint = spec_fingerprint(&tf.spec);
    let revision_changed = status.last_planned_revision.as_deref() != Some(artifact.revision.as_str());

    if let Some(plan) = status.plan.as_ref().filter(|p| p.pending_id().is_some()) {
        let stale =
            plan.spec_fingerprint.as_deref() != Some(fingerprint.as_str()) || revision_changed;
        if stale {
            return Decision::Plan {
                trigger: PlanTrigger::Stale,
                drift_only: false,
            };
        }
        return if plan_approved(tf, plan) {
            Decision::Apply
        } else {
            Decision::AwaitApproval
        };
    }

    let trigger = if status.last_plan_at.is_none() {
        Some(PlanTrigger::FirstRun)
    } else if status.last_plan_fingerprint.as_deref() != Some(fingerprint.as_str()) {
        Some(PlanTrigger::SpecChanged)
    } else if revision_changed {
        Some(PlanTrigger::SourceChanged)
    } else if tf.has_new_reconcile_request() {
        Some(PlanTrigger::ManualRequest)
    } else if status.failure_count > 0 {
        Some(PlanTrigger::Retry)
    } else {
        None
    };
    if let Some(trigger) = trigger {
        return Decision::Plan {
            trigger,
            drift_only: false,
        };
    }

    let now = observation.now;
    let schedule = observation.schedule;
    let until_interval = remaining(status.last_plan_at.as_deref(), schedule.interval, now);
    let until_drift = schedule.drift_interval.map(|drift| {
        let since = status
            .last_drift_check_at
            .as_deref()
            .or(status.last_plan_at.as_deref());
        remaining(since, drift, now)
    });

    if until_drift.is_some_and(|d| d.is_zero()) {
        return Decision::Plan {
            trigger: PlanTrigger::Drift,
            drift_only: true,
        };
    }
    if until_interval.is_zero() {
        return Decision::Plan {
            trigger: PlanTrigger::Interval,
            drift_only: false,
        };
    }
    let next = until_drift.map_or(until_interval, |d| d.min(until_interval));
    Decision::Idle(next.max(MIN_IDLE_REQUEUE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::reconciler::status::timestamp;
    use crate::controller::source::SourceArtifact;
    use crate::crd::TerraformStatus;
    use chrono::TimeZone;

    const REVISION: &str = "main@sha1:7680da431ea59ae7d3f4fdbb903a0f4509da9078";

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn terraform(spec: serde_json::Value) -> Terraform {
        let mut base = serde_json::json!({"sourceRef": {"name": "infra-repo"}, "interval": "5m"});
        if let (Some(base), Some(extra)) = (base.as_object_mut(), spec.as_object()) {
            base.extend(extra.clone());
        }
        let mut tf = Terraform::new("hello", serde_json::from_value(base).unwrap());
        tf.metadata.namespace = Some("flux-system".to_string());
        tf.metadata.generation = Some(1);
        tf
    }

    fn ready_source() -> SourceState {
        SourceState::Ready(SourceArtifact {
            url: "http://source-controller/hello.tar.gz".to_string(),
            revision: REVISION.to_string(),
        })
    }

    /// Status of a module that was planned and applied one minute ago
    fn settled(tf: &Terraform) -> TerraformStatus {
        let at = timestamp(now() - chrono::Duration::minutes(1));
        TerraformStatus {
            observed_generation: Some(1),
            last_plan_at: Some(at.clone()),
            last_drift_check_at: Some(at),
            last_plan_fingerprint: Some(spec_fingerprint(&tf.spec)),
            last_planned_revision: Some(REVISION.to_string()),
            ..Default::default()
        }
    }

    fn decide_now(tf: &Terraform) -> Decision {
        let schedule = Schedule::from_spec(&tf.spec).unwrap();
        let source = ready_source();
        decide(
            tf,
            &Observation {
                now: now(),
                schedule: &schedule,
                source: &source,
                dependencies: None,
            },
        )
    }

    fn pending(tf: &Terraform, id: &str, drift_only: bool) -> PlanStatus {
        PlanStatus {
            pending: Some(id.to_string()),
            is_drift_detection_only: drift_only,
            spec_fingerprint: Some(spec_fingerprint(&tf.spec)),
            ..Default::default()
        }
    }

    #[test]
    fn test_first_run_plans() {
        let tf = terraform(serde_json::json!({}));
        assert_eq!(
            decide_now(&tf),
            Decision::Plan {
                trigger: PlanTrigger::FirstRun,
                drift_only: false
            }
        );
    }

    #[test]
    fn test_source_not_ready_blocks() {
        let tf = terraform(serde_json::json!({}));
        let schedule = Schedule::from_spec(&tf.spec).unwrap();
        let source = SourceState::NotReady("artifact not found".to_string());
        let decision = decide(
            &tf,
            &Observation {
                now: now(),
                schedule: &schedule,
                source: &source,
                dependencies: None,
            },
        );
        assert_eq!(
            decision,
            Decision::Blocked("source not ready: artifact not found".to_string())
        );
    }

    #[test]
    fn test_settled_module_idles_until_next_check() {
        let mut tf = terraform(serde_json::json!({}));
        tf.status = Some(settled(&tf));
        assert_eq!(decide_now(&tf), Decision::Idle(Duration::from_secs(240)));
    }

    #[test]
    fn test_approval_change_does_not_replan() {
        let mut tf = terraform(serde_json::json!({"approvePlan": ""}));
        let mut status = settled(&tf);
        status.plan = Some(pending(&tf, "plan-main-7680da4", false));
        tf.status = Some(status);
        assert_eq!(decide_now(&tf), Decision::AwaitApproval);

        tf.spec.approve_plan = "plan-main-7680da4".to_string();
        assert_eq!(decide_now(&tf), Decision::Apply);

        tf.spec.approve_plan = "plan-main-1111111".to_string();
        assert_eq!(decide_now(&tf), Decision::AwaitApproval);
    }

    #[test]
    fn test_spec_change_makes_pending_plan_stale() {
        let mut tf = terraform(serde_json::json!({"approvePlan": "auto"}));
        let mut status = settled(&tf);
        status.plan = Some(pending(&tf, "plan-main-7680da4", false));
        tf.status = Some(status);
        tf.spec.path = "./other".to_string();
        assert_eq!(
            decide_now(&tf),
            Decision::Plan {
                trigger: PlanTrigger::Stale,
                drift_only: false
            }
        );
    }

    #[test]
    fn test_drift_plan_needs_auto_correct() {
        let mut tf = terraform(serde_json::json!({"approvePlan": "auto", "autoCorrectDrift": false}));
        let mut status = settled(&tf);
        status.plan = Some(pending(&tf, "plan-main-7680da4", true));
        tf.status = Some(status);
        assert_eq!(decide_now(&tf), Decision::AwaitApproval);

        let mut tf = terraform(serde_json::json!({"approvePlan": "auto"}));
        let mut status = settled(&tf);
        status.plan = Some(pending(&tf, "plan-main-7680da4", true));
        tf.status = Some(status);
        assert_eq!(decide_now(&tf), Decision::Apply);
    }

    #[test]
    fn test_drift_check_runs_when_due() {
        let mut tf = terraform(serde_json::json!({"driftDetectionInterval": "30s"}));
        tf.status = Some(settled(&tf));
        assert_eq!(
            decide_now(&tf),
            Decision::Plan {
                trigger: PlanTrigger::Drift,
                drift_only: true
            }
        );

        let mut tf = terraform(serde_json::json!({
            "driftDetectionInterval": "30s",
            "disableDriftDetection": true
        }));
        tf.status = Some(settled(&tf));
        assert_eq!(decide_now(&tf), Decision::Idle(Duration::from_secs(240)));
    }

    #[test]
    fn test_manual_request_and_failure_replan() {
        let mut tf = terraform(serde_json::json!({}));
        tf.status = Some(settled(&tf));
        tf.request_reconcile(now());
        assert_eq!(
            decide_now(&tf),
            Decision::Plan {
                trigger: PlanTrigger::ManualRequest,
                drift_only: false
            }
        );

        let mut tf = terraform(serde_json::json!({}));
        let mut status = settled(&tf);
        status.failure_count = 2;
        tf.status = Some(status);
        assert_eq!(
            decide_now(&tf),
            Decision::Plan {
                trigger: PlanTrigger::Retry,
                drift_only: false
            }
        );
    }

    #[test]
    fn test_lifecycle_precedence() {
        let liveness = Duration::from_secs(900);
        let mut tf = terraform(serde_json::json!({"suspend": true}));
        assert_eq!(
            lifecycle_decision(&tf, now(), "tf-controller", liveness),
            Some(Lifecycle::Suspend)
        );

        tf.metadata.deletion_timestamp =
            Some(serde_json::from_value(serde_json::json!("2024-05-01T12:00:00Z")).unwrap());
        assert_eq!(
            lifecycle_decision(&tf, now(), "tf-controller", liveness),
            Some(Lifecycle::Finalize)
        );

        tf.status = Some(TerraformStatus {
            observed_generation: Some(1),
            retry_after: Some(timestamp(now() + chrono::Duration::seconds(30))),
            ..Default::default()
        });
        assert_eq!(
            lifecycle_decision(&tf, now(), "tf-controller", liveness),
            Some(Lifecycle::WaitForRetry(Duration::from_secs(30)))
        );
    }

    #[test]
    fn test_deleting_module_honours_force_unlock_before_destroy() {
        let liveness = Duration::from_secs(900);
        let mut tf = terraform(serde_json::json!({
            "backendConfig": {"state": {"forceUnlock": "auto"}}
        }));
        tf.metadata.deletion_timestamp =
            Some(serde_json::from_value(serde_json::json!("2024-05-01T12:00:00Z")).unwrap());
        tf.status = Some(TerraformStatus {
            observed_generation: Some(1),
            lock: Some(crate::crd::LockStatus {
                holder: Some("crashed-peer".to_string()),
                acquired_at: Some(timestamp(now() - chrono::Duration::hours(2))),
                ..Default::default()
            }),
            ..Default::default()
        });
        assert_eq!(
            lifecycle_decision(&tf, now(), "tf-controller", liveness),
            Some(Lifecycle::ForceUnlock(ForceUnlock::Auto))
        );

        // A pending retry wait still comes first
        if let Some(status) = tf.status.as_mut() {
            status.retry_after = Some(timestamp(now() + chrono::Duration::seconds(30)));
        }
        assert_eq!(
            lifecycle_decision(&tf, now(), "tf-controller", liveness),
            Some(Lifecycle::WaitForRetry(Duration::from_secs(30)))
        );

        // Once the holder is cleared, deletion proceeds
        if let Some(status) = tf.status.as_mut() {
            status.retry_after = None;
            status.lock = None;
        }
        assert_eq!(
            lifecycle_decision(&tf, now(), "tf-controller", liveness),
            Some(Lifecycle::Finalize)
        );
    }

    #[test]
    fn test_plan_ids_never_repeat_an_applied_or_pending_name() {
        assert_eq!(next_plan_id("main-7680da4", None), "plan-main-7680da4");

        let mut plan = PlanStatus {
            last_applied: Some("plan-main-7680da4".to_string()),
            ..Default::default()
        };
        assert_eq!(next_plan_id("main-7680da4", Some(&plan)), "plan-main-7680da4-2");

        plan.pending = Some("plan-main-7680da4-2".to_string());
        assert_eq!(next_plan_id("main-7680da4", Some(&plan)), "plan-main-7680da4-3");

        // A new revision starts over
        assert_eq!(next_plan_id("main-1b2c3d4", Some(&plan)), "plan-main-1b2c3d4");
    }

    #[test]
    fn test_applied_plan_name_approves_nothing() {
        let mut tf = terraform(serde_json::json!({"approvePlan": "plan-main-7680da4"}));
        let mut plan = pending(&tf, "plan-main-7680da4", false);
        assert!(plan_approved(&tf, &plan));

        plan.last_applied = Some("plan-main-7680da4".to_string());
        assert!(!plan_approved(&tf, &plan));

        tf.spec.auto_correct_drift = Some(false);
        let mut drift = pending(&tf, "plan-main-7680da4-2", true);
        drift.last_applied = Some("plan-main-7680da4".to_string());
        assert!(!plan_approved(&tf, &drift));
    }

    #[test]
    fn test_spec_edit_cuts_retry_wait_short() {
        let mut tf = terraform(serde_json::json!({}));
        tf.status = Some(TerraformStatus {
            observed_generation: Some(1),
            retry_after: Some(timestamp(now() + chrono::Duration::seconds(30))),
            ..Default::default()
        });
        assert!(retry_wait(&tf, now()).is_some());
        tf.metadata.generation = Some(2);
        assert!(retry_wait(&tf, now()).is_none());
    }

    #[test]
    fn test_fingerprint_ignores_approval_and_unlock() {
        let tf = terraform(serde_json::json!({}));
        let mut edited = tf.spec.clone();
        edited.approve_plan = "auto".to_string();
        edited.suspend = true;
        assert_eq!(spec_fingerprint(&tf.spec), spec_fingerprint(&edited));

        edited.destroy = true;
        assert_ne!(spec_fingerprint(&tf.spec), spec_fingerprint(&edited));
    }
}
