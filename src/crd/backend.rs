//! # Backend Configuration
//!
//! State backend settings and the force-unlock escape hatch.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Force-unlock sentinel: always clear whatever lock is held
pub const FORCE_UNLOCK_AUTO: &str = "auto";

/// Force-unlock value meaning "never force unlock"
pub const FORCE_UNLOCK_NO: &str = "no";

/// State backend configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfigSpec {
    /// Disable the in-cluster backend entirely (the module brings its own)
    #[serde(default)]
    pub disable: bool,
    /// Suffix of the state secret name (defaults to the workspace + name)
    #[serde(default)]
    pub secret_suffix: Option<String>,
    /// Use in-cluster credentials for the kubernetes backend
    #[serde(default)]
    pub in_cluster_config: bool,
    /// Verbatim backend block replacing the generated one
    #[serde(default)]
    pub custom_configuration: Option<String>,
    /// Kubeconfig path for the kubernetes backend
    #[serde(default)]
    pub config_path: Option<String>,
    /// Labels applied to the state secret
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// State lock handling
    #[serde(default)]
    pub state: Option<TFStateSpec>,
}

/// State lock handling
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TFStateSpec {
    /// Lock ID to force-unlock once, `auto` to always clear held locks,
    /// or empty / `no` to never force unlock
    #[serde(default)]
    pub force_unlock: String,
    /// How long the tool waits for a held lock before failing
    #[serde(default)]
    pub lock_timeout: Option<String>,
}

/// Secret or ConfigMap contributing backend configuration keys
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfigsReference {
    /// Secret or ConfigMap
    pub kind: crate::crd::DataSourceKind,
    pub name: String,
    /// Keys to read; all keys when empty
    #[serde(default)]
    pub keys: Vec<String>,
    /// Do not fail when the object is missing
    #[serde(default)]
    pub optional: bool,
}

/// Remote (cloud) backend
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CloudSpec {
    pub organization: String,
    #[serde(default)]
    pub workspaces: Option<CloudWorkspacesSpec>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CloudWorkspacesSpec {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}
