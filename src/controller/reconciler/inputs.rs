//! # Inputs and Outputs
//!
//! Resolves input variables and backend configuration from Secrets and
//! ConfigMaps before `init`, and selects which outputs land in the outputs
//! secret after `apply`.
//!
//! Variable precedence, lowest first: `varsFrom` in order, then
//! `readInputsFromSecrets`, then inline `vars`, then `values`.

use crate::controller::reconciler::types::ReconcilerError;
use crate::controller::secrets::{SecretsClient, SecretsError};
use crate::controller::session::{InitRequest, OutputValue};
use crate::controller::source::SourceArtifact;
use crate::crd::{DataSourceKind, KeySelector, Terraform, WriteOutputsToSecretSpec};
use kube::ResourceExt;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

/// Reserved variable carrying `spec.values`
pub const VALUES_VARIABLE: &str = "values";

/// `key` or `key:alias` split into source key and target name
fn split_alias(entry: &str) -> (&str, &str) {
    match entry.split_once(':') {
        Some((key, alias)) => (key, alias),
        None => (entry, entry),
    }
}

async fn read_data(
    secrets: &dyn SecretsClient,
    namespace: &str,
    kind: DataSourceKind,
    name: &str,
    optional: bool,
) -> Result<Option<BTreeMap<String, String>>, ReconcilerError> {
    match secrets.read(namespace, kind, name).await? {
        Some(data) => Ok(Some(data)),
        None if optional => {
            debug!(kind = kind.as_str(), name, "Optional input source not found, skipping");
            Ok(None)
        }
        None => Err(SecretsError::NotFound {
            kind: kind.as_str(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
        .into()),
    }
}

async fn read_key(
    secrets: &dyn SecretsClient,
    namespace: &str,
    kind: DataSourceKind,
    selector: &KeySelector,
) -> Result<Option<String>, ReconcilerError> {
    let Some(data) = read_data(secrets, namespace, kind, &selector.name, selector.optional).await?
    else {
        return Ok(None);
    };
    match data.get(&selector.key) {
        Some(value) => Ok(Some(value.clone())),
        None if selector.optional => Ok(None),
        None => Err(SecretsError::MissingKey {
            kind: kind.as_str(),
            name: selector.name.clone(),
            key: selector.key.clone(),
        }
        .into()),
    }
}

/// Input variables of a module with every secret reference resolved
pub async fn resolve_variables(
    secrets: &dyn SecretsClient,
    tf: &Terraform,
) -> Result<BTreeMap<String, Value>, ReconcilerError> {
    let namespace = tf.namespace().unwrap_or_default();
    let mut variables = BTreeMap::new();

    for reference in &tf.spec.vars_from {
        let Some(data) = read_data(
            secrets,
            &namespace,
            reference.kind,
            &reference.name,
            reference.optional,
        )
        .await?
        else {
            continue;
        };
        if reference.vars_keys.is_empty() {
            variables.extend(data.into_iter().map(|(k, v)| (k, Value::String(v))));
            continue;
        }
        for entry in &reference.vars_keys {
            let (key, alias) = split_alias(entry);
            match data.get(key) {
                Some(value) => {
                    variables.insert(alias.to_string(), Value::String(value.clone()));
                }
                None if reference.optional => {}
                None => {
                    return Err(SecretsError::MissingKey {
                        kind: reference.kind.as_str(),
                        name: reference.name.clone(),
                        key: key.to_string(),
                    }
                    .into())
                }
            }
        }
    }

    for input in &tf.spec.read_inputs_from_secrets {
        let data = read_data(secrets, &namespace, DataSourceKind::Secret, &input.name, false)
            .await?
            .unwrap_or_default();
        let object = data
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect::<serde_json::Map<_, _>>();
        variables.insert(input.as_name.clone(), Value::Object(object));
    }

    for variable in &tf.spec.vars {
        let value = match &variable.value_from {
            Some(source) => {
                let resolved = match (&source.secret_key_ref, &source.config_map_key_ref) {
                    (Some(selector), _) => {
                        read_key(secrets, &namespace, DataSourceKind::Secret, selector).await?
                    }
                    (None, Some(selector)) => {
                        read_key(secrets, &namespace, DataSourceKind::ConfigMap, selector).await?
                    }
                    (None, None) => {
                        return Err(ReconcilerError::Invalid(format!(
                            "vars[{}].valueFrom has no reference",
                            variable.name
                        )))
                    }
                };
                match resolved {
                    Some(value) => Value::String(value),
                    None => continue,
                }
            }
            None => variable.value.clone().unwrap_or(Value::Null),
        };
        variables.insert(variable.name.clone(), value);
    }

    if let Some(values) = &tf.spec.values {
        variables.insert(VALUES_VARIABLE.to_string(), values.clone());
    }
    Ok(variables)
}

/// Extra backend settings gathered from `backendConfigsFrom`
pub async fn resolve_backend_configs(
    secrets: &dyn SecretsClient,
    tf: &Terraform,
) -> Result<BTreeMap<String, String>, ReconcilerError> {
    let namespace = tf.namespace().unwrap_or_default();
    let mut configs = BTreeMap::new();
    for reference in &tf.spec.backend_configs_from {
        let Some(data) = read_data(
            secrets,
            &namespace,
            reference.kind,
            &reference.name,
            reference.optional,
        )
        .await?
        else {
            continue;
        };
        if reference.keys.is_empty() {
            configs.extend(data);
            continue;
        }
        for key in &reference.keys {
            match data.get(key) {
                Some(value) => {
                    configs.insert(key.clone(), value.clone());
                }
                None if reference.optional => {}
                None => {
                    return Err(SecretsError::MissingKey {
                        kind: reference.kind.as_str(),
                        name: reference.name.clone(),
                        key: key.clone(),
                    }
                    .into())
                }
            }
        }
    }
    Ok(configs)
}

/// Everything `init` needs to prepare the working directory
pub async fn init_request(
    secrets: &dyn SecretsClient,
    tf: &Terraform,
    artifact: &SourceArtifact,
) -> Result<InitRequest, ReconcilerError> {
    let spec = &tf.spec;
    Ok(InitRequest {
        source_url: artifact.url.clone(),
        revision: artifact.revision.clone(),
        path: spec.path.clone(),
        workspace: spec.workspace.clone(),
        backend_config: spec.backend_config.clone(),
        backend_configs: resolve_backend_configs(secrets, tf).await?,
        variables: resolve_variables(secrets, tf).await?,
        cloud: spec.cloud.clone(),
        lock_timeout: spec
            .backend_config
            .as_ref()
            .and_then(|backend| backend.state.as_ref())
            .and_then(|state| state.lock_timeout.clone()),
    })
}

fn render_output(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Outputs written to the outputs secret
///
/// An empty selection writes every output under its own name. Entries of the
/// form `name:alias` rename; outputs the module did not produce are skipped.
#[must_use]
pub fn select_outputs(
    outputs: &BTreeMap<String, OutputValue>,
    spec: &WriteOutputsToSecretSpec,
) -> BTreeMap<String, String> {
    if spec.outputs.is_empty() {
        return outputs
            .iter()
            .map(|(name, output)| (name.clone(), render_output(&output.value)))
            .collect();
    }
    spec.outputs
        .iter()
        .filter_map(|entry| {
            let (name, alias) = split_alias(entry);
            outputs
                .get(name)
                .map(|output| (alias.to_string(), render_output(&output.value)))
        })
        .collect()
}

/// Outputs as one JSON document, for templates in health checks
#[must_use]
pub fn outputs_document(outputs: &BTreeMap<String, OutputValue>) -> Value {
    Value::Object(
        outputs
            .iter()
            .map(|(name, output)| (name.clone(), output.value.clone()))
            .collect(),
    )
}
