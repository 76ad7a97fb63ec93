//! # Custom Resource Definitions
//!
//! CRD types for the Terraform controller.
//!
//! ## Module Structure
//!
//! - `spec.rs` - Main CRD specification, approval mode and default values
//! - `backend.rs` - State backend configuration and the force-unlock token
//! - `runner.rs` - Runner pod template overrides
//! - `variables.rs` - Input variables, file mappings and output secrets
//! - `webhook.rs` - Webhooks and health checks
//! - `status.rs` - Status types: phase, conditions, plan, lock, inventory

mod backend;
mod runner;
mod spec;
mod status;
mod variables;
mod webhook;

pub use backend::{
    BackendConfigSpec, BackendConfigsReference, CloudSpec, CloudWorkspacesSpec, TFStateSpec,
    FORCE_UNLOCK_AUTO, FORCE_UNLOCK_NO,
};
pub use runner::{RunnerPodMetadata, RunnerPodSpec, RunnerPodTemplate};
pub use spec::{
    default_interval, default_service_account, default_workspace, ApprovalMode,
    CrossNamespaceSourceReference, NamespacedObjectReference, ReadablePlanFormat, Terraform,
    TerraformSpec,
};
pub use status::{
    Condition, LockStatus, Phase, PlanStatus, ResourceInventory, ResourceRef, RunnerPodRef,
    TerraformStatus, CONDITION_APPLY, CONDITION_DRIFTED, CONDITION_HEALTHY, CONDITION_OUTPUT,
    CONDITION_PLAN, CONDITION_READY, CONDITION_STATE_LOCKED,
};
pub use variables::{
    DataSourceKind, FileMapping, FileMappingLocation, KeySelector, ReadInputsFromSecretSpec,
    SecretReference, Variable, VariableSource, VarsReference, WriteOutputsToSecretSpec,
};
pub use webhook::{HealthCheck, HealthCheckType, PayloadType, Webhook, WebhookStage};

/// Schema for free-form JSON fields (variable values, `values`)
///
/// The API server keeps arbitrary content only when the schema says so.
pub fn any_json_schema(_generator: &mut schemars::SchemaGenerator) -> schemars::Schema {
    schemars::json_schema!({
        "nullable": true,
        "x-kubernetes-preserve-unknown-fields": true
    })
}
