//! # Runner Pod Template
//!
//! Overrides applied on top of the controller's default runner pod.

use k8s_openapi::api::core::v1::{
    Affinity, Container, EnvFromSource, EnvVar, HostAlias, ResourceRequirements, SecurityContext,
    Toleration, Volume, VolumeMount,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RunnerPodTemplate {
    #[serde(default)]
    pub metadata: RunnerPodMetadata,
    #[serde(default)]
    pub spec: RunnerPodSpec,
}

/// Labels and annotations merged onto the runner pod
///
/// On a key collision with controller bookkeeping labels, these values win.
#[derive(Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RunnerPodMetadata {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RunnerPodSpec {
    /// Runner image. Defaults to the controller's `RUNNER_IMAGE`
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub env_from: Vec<EnvFromSource>,
    /// Environment variables, applied first and in declared order
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default)]
    pub affinity: Option<Affinity>,
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
    #[serde(default)]
    pub init_containers: Vec<Container>,
    #[serde(default)]
    pub host_aliases: Vec<HostAlias>,
    #[serde(default)]
    pub priority_class_name: Option<String>,
    #[serde(default)]
    pub security_context: Option<SecurityContext>,
    #[serde(default)]
    pub resources: Option<ResourceRequirements>,
}
