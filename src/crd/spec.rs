//! # Terraform Spec
//!
//! Main CRD specification types and default values.

use crate::constants::{DEFAULT_INTERVAL, DEFAULT_RETRY_INTERVAL, RECONCILE_REQUEST_ANNOTATION};
use serde::{Deserialize, Serialize};

/// Terraform Custom Resource Definition
///
/// Declares one infrastructure-as-code module: where its source comes from,
/// how it is planned and approved, and how the runner that executes it is
/// shaped.
///
/// # Example
///
/// ```yaml
/// apiVersion: infra.contrib.fluxcd.io/v1alpha1
/// kind: Terraform
/// metadata:
///   name: hello-world
///   namespace: flux-system
/// spec:
///   interval: 1m
///   approvePlan: auto
///   path: ./terraform/hello-world
///   sourceRef:
///     kind: GitRepository
///     name: infra-repo
///   writeOutputsToSecret:
///     name: hello-world-outputs
/// ```
#[derive(kube::CustomResource, Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "Terraform",
    group = "infra.contrib.fluxcd.io",
    version = "v1alpha1",
    namespaced,
    status = "crate::crd::TerraformStatus",
    shortname = "tf",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}, {"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}, {"name":"Status", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].message"}, {"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TerraformSpec {
    /// Flux source providing the module files
    pub source_ref: CrossNamespaceSourceReference,
    /// Working directory within the source artifact
    #[serde(default)]
    pub path: String,
    /// Reconcile period
    /// Format: Kubernetes duration string (e.g., "1m", "5m", "1h")
    /// Default: "5m"
    #[serde(default = "default_interval")]
    pub interval: String,
    /// Minimum delay before retrying after a semantic failure
    /// (execution failure, policy denial). Default: "15s"
    #[serde(default)]
    pub retry_interval: Option<String>,
    /// Approval mode
    /// `auto` applies every plan, a plan name applies exactly that pending plan,
    /// empty or `false` never applies
    #[serde(default)]
    pub approve_plan: String,
    /// Plan a destroy of all managed resources instead of converging them
    #[serde(default)]
    pub destroy: bool,
    /// Destroy managed resources when this object is deleted
    #[serde(default)]
    pub destroy_resources_on_deletion: bool,
    /// State backend configuration, including the force-unlock token
    #[serde(default)]
    pub backend_config: Option<crate::crd::BackendConfigSpec>,
    /// Secrets or ConfigMaps contributing extra backend configuration
    #[serde(default)]
    pub backend_configs_from: Vec<crate::crd::BackendConfigsReference>,
    /// Backend workspace
    #[serde(default = "default_workspace")]
    pub workspace: String,
    /// Inline input variables (applied after `varsFrom`, later entries win)
    #[serde(default)]
    pub vars: Vec<crate::crd::Variable>,
    /// Secrets or ConfigMaps whose keys become input variables
    #[serde(default)]
    pub vars_from: Vec<crate::crd::VarsReference>,
    /// Free-form values passed to the module as the `values` variable
    #[serde(default)]
    #[schemars(schema_with = "crate::crd::any_json_schema")]
    pub values: Option<serde_json::Value>,
    /// Secret content mounted as files into the runner
    #[serde(default)]
    pub file_mappings: Vec<crate::crd::FileMapping>,
    /// Output secrets of other modules read as inputs
    #[serde(default)]
    pub read_inputs_from_secrets: Vec<crate::crd::ReadInputsFromSecretSpec>,
    /// Secret receiving the module outputs after each successful apply
    #[serde(default)]
    pub write_outputs_to_secret: Option<crate::crd::WriteOutputsToSecretSpec>,
    /// Secret holding the CLI configuration file (credentials for private registries)
    #[serde(default)]
    pub cli_config_secret_ref: Option<crate::crd::SecretReference>,
    /// Checks run after a successful apply
    #[serde(default)]
    pub health_checks: Vec<crate::crd::HealthCheck>,
    /// Policy callbacks consulted between plan and apply
    #[serde(default)]
    pub webhooks: Vec<crate::crd::Webhook>,
    /// Modules that must be Ready before this one leaves Initializing
    #[serde(default)]
    pub depends_on: Vec<NamespacedObjectReference>,
    /// Resource addresses to restrict plan and apply to
    #[serde(default)]
    pub targets: Vec<String>,
    /// Freeze all transitions
    #[serde(default)]
    pub suspend: bool,
    /// Delete the runner pod after every terminal outcome
    /// Default: true
    #[serde(default)]
    pub always_cleanup_runner_pod: Option<bool>,
    /// Termination grace period of the runner pod (seconds)
    #[serde(default)]
    pub runner_termination_grace_period_seconds: Option<i64>,
    /// Overrides applied to the runner pod
    #[serde(default)]
    pub runner_pod_template: Option<crate::crd::RunnerPodTemplate>,
    /// Service account the runner pod runs as
    #[serde(default = "default_service_account")]
    pub service_account_name: String,
    /// Persist a human-readable rendering of each pending plan to a ConfigMap
    #[serde(default)]
    pub store_readable_plan: ReadablePlanFormat,
    /// Turn off plan-only drift checks
    #[serde(default)]
    pub disable_drift_detection: bool,
    /// Drift check period. Defaults to `interval`
    #[serde(default)]
    pub drift_detection_interval: Option<String>,
    /// Apply drift corrections without approval.
    /// Defaults to true when `approvePlan` is `auto`
    #[serde(default)]
    pub auto_correct_drift: Option<bool>,
    /// Parallelism passed to the execution tool (0 = tool default)
    #[serde(default)]
    pub parallelism: i32,
    /// Refresh state before apply
    #[serde(default)]
    pub refresh_before_apply: bool,
    /// Remote (cloud) backend settings
    #[serde(default)]
    pub cloud: Option<crate::crd::CloudSpec>,
}

/// Reference to a Flux source object
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CrossNamespaceSourceReference {
    /// Source kind: GitRepository, Bucket or OCIRepository
    #[serde(default = "default_source_kind")]
    pub kind: String,
    /// Source name
    pub name: String,
    /// Source namespace. Defaults to the namespace of the Terraform object
    #[serde(default)]
    pub namespace: Option<String>,
    /// Source API version
    #[serde(default)]
    pub api_version: Option<String>,
}

/// Reference to another Terraform object
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NamespacedObjectReference {
    pub name: String,
    /// Defaults to the namespace of the referring object
    #[serde(default)]
    pub namespace: Option<String>,
}

/// Format of the readable plan stored alongside a pending plan
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ReadablePlanFormat {
    #[default]
    None,
    Json,
    Human,
}

/// Parsed form of `spec.approvePlan`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalMode {
    /// Every plan is applied as soon as it is accepted by the webhook gate
    Auto,
    /// Plans are never applied
    Disabled,
    /// Only the pending plan with exactly this identifier is applied
    Plan(String),
}

impl ApprovalMode {
    #[must_use]
    pub fn from_spec(value: &str) -> Self {
        match value.trim() {
            "auto" => Self::Auto,
            "" | "false" => Self::Disabled,
            name => Self::Plan(name.to_string()),
        }
    }

    /// Whether this mode lets the pending plan `pending` proceed to apply
    ///
    /// An explicit approval only fires on exact equality, so an approval
    /// written for a superseded plan never applies its successor.
    #[must_use]
    pub fn approves(&self, pending: &str) -> bool {
        match self {
            Self::Auto => !pending.is_empty(),
            Self::Disabled => false,
            Self::Plan(name) => !pending.is_empty() && name == pending,
        }
    }
}

impl TerraformSpec {
    #[must_use]
    pub fn approval_mode(&self) -> ApprovalMode {
        ApprovalMode::from_spec(&self.approve_plan)
    }

    #[must_use]
    pub fn drift_detection_enabled(&self) -> bool {
        !self.disable_drift_detection
    }

    /// Drift corrections are applied without approval
    #[must_use]
    pub fn auto_correct_drift(&self) -> bool {
        self.auto_correct_drift
            .unwrap_or_else(|| self.approval_mode() == ApprovalMode::Auto)
    }

    #[must_use]
    pub fn cleanup_runner_pod(&self) -> bool {
        self.always_cleanup_runner_pod.unwrap_or(true)
    }

    #[must_use]
    pub fn retry_interval_or_default(&self) -> &str {
        self.retry_interval
            .as_deref()
            .unwrap_or(DEFAULT_RETRY_INTERVAL)
    }

    /// Raw force-unlock token from `backendConfig.state.forceUnlock`
    #[must_use]
    pub fn force_unlock_token(&self) -> Option<&str> {
        self.backend_config
            .as_ref()
            .and_then(|backend| backend.state.as_ref())
            .map(|state| state.force_unlock.trim())
            .filter(|token| !token.is_empty())
    }
}

impl Terraform {
    /// Value of the reconcile-request annotation, if set
    #[must_use]
    pub fn reconcile_request(&self) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(RECONCILE_REQUEST_ANNOTATION))
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    /// Touch the reconcile-request annotation so the controller acts immediately
    pub fn request_reconcile(&mut self, now: chrono::DateTime<chrono::Utc>) {
        self.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(
                RECONCILE_REQUEST_ANNOTATION.to_string(),
                now.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
            );
    }

    /// A reconcile request that has not been acted on yet
    #[must_use]
    pub fn has_new_reconcile_request(&self) -> bool {
        match self.reconcile_request() {
            Some(requested) => {
                self.status
                    .as_ref()
                    .and_then(|status| status.last_handled_reconcile_at.as_deref())
                    != Some(requested)
            }
            None => false,
        }
    }
}

/// Default value for source kind
pub fn default_source_kind() -> String {
    "GitRepository".to_string()
}

/// Default value for reconcile interval
pub fn default_interval() -> String {
    DEFAULT_INTERVAL.to_string()
}

/// Default backend workspace
pub fn default_workspace() -> String {
    "default".to_string()
}

/// Default runner service account
pub fn default_service_account() -> String {
    "tf-runner".to_string()
}
