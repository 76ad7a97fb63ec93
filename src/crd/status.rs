//! # Terraform Status
//!
//! Status types for tracking plan, lock, inventory and conditions.
//!
//! Every field is independently nullable. `None` serializes as `null`, so a
//! merge patch carrying the whole status clears fields that were reset.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Condition types written by the controller
pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_PLAN: &str = "Plan";
pub const CONDITION_APPLY: &str = "Apply";
pub const CONDITION_OUTPUT: &str = "Output";
pub const CONDITION_HEALTHY: &str = "HealthCheck";
pub const CONDITION_STATE_LOCKED: &str = "StateLocked";
pub const CONDITION_DRIFTED: &str = "Drifted";

/// Lifecycle phase of a module
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, schemars::JsonSchema)]
pub enum Phase {
    Initializing,
    Planning,
    AwaitingApproval,
    Applying,
    Applied,
    Drifted,
    Destroying,
    Finalized,
    Suspended,
    Failed,
}

impl Phase {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Initializing => "Initializing",
            Phase::Planning => "Planning",
            Phase::AwaitingApproval => "AwaitingApproval",
            Phase::Applying => "Applying",
            Phase::Applied => "Applied",
            Phase::Drifted => "Drifted",
            Phase::Destroying => "Destroying",
            Phase::Finalized => "Finalized",
            Phase::Suspended => "Suspended",
            Phase::Failed => "Failed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of the Terraform resource
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TerraformStatus {
    /// Current lifecycle phase
    #[serde(default)]
    pub phase: Option<Phase>,
    /// Generation last acted on
    #[serde(default)]
    pub observed_generation: Option<i64>,
    /// Conditions represent the latest available observations
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Pending plan, if any
    #[serde(default)]
    pub plan: Option<PlanStatus>,
    /// Holder of the backing-state lock
    #[serde(default)]
    pub lock: Option<LockStatus>,
    /// Resources owned by the module, refreshed after each successful apply
    #[serde(default)]
    pub inventory: Option<ResourceInventory>,
    /// Output names (values are never stored in status)
    #[serde(default)]
    pub available_outputs: Vec<String>,
    /// Last time a drift check found changes (RFC3339)
    #[serde(default)]
    pub last_drift_detected_at: Option<String>,
    /// Last time a drift correction was applied (RFC3339)
    #[serde(default)]
    pub last_applied_by_drift_detection_at: Option<String>,
    /// Last time a drift check ran, with or without changes (RFC3339)
    #[serde(default)]
    pub last_drift_check_at: Option<String>,
    /// Source revision of the last successful apply
    #[serde(default)]
    pub last_applied_revision: Option<String>,
    /// Source revision of the last attempt
    #[serde(default)]
    pub last_attempted_revision: Option<String>,
    /// Source revision the last plan was computed from
    #[serde(default)]
    pub last_planned_revision: Option<String>,
    /// Last time a plan completed (RFC3339)
    #[serde(default)]
    pub last_plan_at: Option<String>,
    /// Fingerprint of the spec the last plan was computed from
    #[serde(default)]
    pub last_plan_fingerprint: Option<String>,
    /// Generation of the last successful apply
    #[serde(default)]
    pub last_applied_generation: Option<i64>,
    /// Consecutive failed attempts
    #[serde(default)]
    pub failure_count: u32,
    /// Earliest time of the next attempt after a failure (RFC3339)
    #[serde(default)]
    pub retry_after: Option<String>,
    /// Value of the reconcile-request annotation last acted on
    #[serde(default)]
    pub last_handled_reconcile_at: Option<String>,
    /// Why the module is not progressing (source or dependency)
    #[serde(default)]
    pub blocking_reason: Option<String>,
}

/// A plan waiting for approval
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlanStatus {
    /// Identifier of the pending plan, e.g. `plan-main-7680da4`
    #[serde(default)]
    pub pending: Option<String>,
    #[serde(default)]
    pub is_destroy_plan: bool,
    /// Plan produced by a drift check
    #[serde(default)]
    pub is_drift_detection_only: bool,
    /// Identifier of the last applied plan
    #[serde(default)]
    pub last_applied: Option<String>,
    /// Runner that holds the plan artifact
    #[serde(default)]
    pub runner_pod: Option<RunnerPodRef>,
    /// Spec fingerprint the plan was computed from
    #[serde(default)]
    pub spec_fingerprint: Option<String>,
}

impl PlanStatus {
    /// Pending plan identifier, if a plan is pending
    #[must_use]
    pub fn pending_id(&self) -> Option<&str> {
        self.pending.as_deref().filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RunnerPodRef {
    pub name: String,
    pub uid: String,
}

/// Exclusivity marker over the module's backing state
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LockStatus {
    /// Controller instance holding the lock
    #[serde(default)]
    pub holder: Option<String>,
    /// Acquisition or refresh time (RFC3339)
    #[serde(default)]
    pub acquired_at: Option<String>,
    /// Last force-unlock token acted on
    #[serde(default)]
    pub last_applied_force_unlock: Option<String>,
    /// Lock ID reported by the backend when a foreign lock blocked an attempt
    #[serde(default)]
    pub pending: Option<String>,
}

impl LockStatus {
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.holder.as_deref().is_some_and(|h| !h.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInventory {
    #[serde(default)]
    pub entries: Vec<ResourceRef>,
}

impl ResourceInventory {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Managed resource, e.g. `aws_s3_bucket.logs`
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    pub name: String,
    pub r#type: String,
    /// Provider-side identifier
    #[serde(default)]
    pub identifier: String,
}

/// Condition represents a condition of a resource
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    pub r#type: String,
    /// Status of the condition (True, False, Unknown)
    pub status: String,
    #[serde(default)]
    pub observed_generation: Option<i64>,
    /// Last transition time
    #[serde(default)]
    pub last_transition_time: Option<String>,
    /// Reason for the condition
    #[serde(default)]
    pub reason: Option<String>,
    /// Message describing the condition
    #[serde(default)]
    pub message: Option<String>,
}

impl TerraformStatus {
    #[must_use]
    pub fn condition(&self, condition_type: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.r#type == condition_type)
    }

    /// Ready=True for the given generation
    #[must_use]
    pub fn is_ready_at(&self, generation: Option<i64>) -> bool {
        let ready = self
            .condition(CONDITION_READY)
            .is_some_and(|c| c.status == "True");
        ready && self.observed_generation == generation
    }

    #[must_use]
    pub fn pending_plan(&self) -> Option<&str> {
        self.plan.as_ref().and_then(PlanStatus::pending_id)
    }

    #[must_use]
    pub fn inventory_is_empty(&self) -> bool {
        self.inventory.as_ref().is_none_or(ResourceInventory::is_empty)
    }
}
