//! # Inputs and Outputs
//!
//! Input variables, secret-backed files and the outputs secret.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Kind of object a data reference points at
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, schemars::JsonSchema)]
pub enum DataSourceKind {
    Secret,
    ConfigMap,
}

impl DataSourceKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSourceKind::Secret => "Secret",
            DataSourceKind::ConfigMap => "ConfigMap",
        }
    }
}

/// Inline input variable
#[derive(Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub name: String,
    /// Literal value (any JSON)
    #[serde(default)]
    #[schemars(schema_with = "crate::crd::any_json_schema")]
    pub value: Option<serde_json::Value>,
    /// Value read from a Secret or ConfigMap key
    #[serde(default)]
    pub value_from: Option<VariableSource>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VariableSource {
    #[serde(default)]
    pub secret_key_ref: Option<KeySelector>,
    #[serde(default)]
    pub config_map_key_ref: Option<KeySelector>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KeySelector {
    pub name: String,
    pub key: String,
    #[serde(default)]
    pub optional: bool,
}

/// Secret or ConfigMap whose keys become input variables
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VarsReference {
    pub kind: DataSourceKind,
    pub name: String,
    /// Keys to import; all keys when empty. `key:alias` renames the variable
    #[serde(default)]
    pub vars_keys: Vec<String>,
    #[serde(default)]
    pub optional: bool,
}

/// Reference to a secret in the object's namespace
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    pub name: String,
    /// Key holding the content. Defaults to `terraform.rc` for CLI config
    #[serde(default)]
    pub key: Option<String>,
}

/// Where a mapped file is placed inside the runner
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum FileMappingLocation {
    Home,
    Workspace,
}

/// Secret key mounted as a file inside the runner
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FileMapping {
    pub secret_ref: KeySelector,
    pub location: FileMappingLocation,
    /// Path relative to the location
    pub path: String,
}

/// Another module's outputs secret read as input variables
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReadInputsFromSecretSpec {
    /// Secret name
    pub name: String,
    /// Variable name the secret's content is exposed as (an object of all keys)
    #[serde(rename = "as")]
    pub as_name: String,
}

/// Secret receiving module outputs
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WriteOutputsToSecretSpec {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Outputs to write; all outputs when empty. `name:alias` renames the key
    #[serde(default)]
    pub outputs: Vec<String>,
}
