//! # Secrets and ConfigMaps
//!
//! Reads input data (`varsFrom`, `readInputsFromSecrets`, `valueFrom`) and
//! writes the outputs secret and the readable plan ConfigMap.
//!
//! Values pass through this module but are never logged.

use crate::constants::{CONTROLLER_NAME, CREATED_BY_LABEL, TERRAFORM_NAME_LABEL};
use crate::crd::{DataSourceKind, Terraform, WriteOutputsToSecretSpec};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::{Client, Resource, ResourceExt};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

/// Key of the plan content inside the readable plan ConfigMap
pub const READABLE_PLAN_KEY: &str = "tfplan";

#[derive(Debug, Error)]
pub enum SecretsError {
    #[error("{kind} '{namespace}/{name}' not found")]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },
    #[error("key '{key}' not found in {kind} '{name}'")]
    MissingKey {
        kind: &'static str,
        name: String,
        key: String,
    },
    #[error("Kubernetes API request failed: {0}")]
    Kube(#[from] kube::Error),
    #[error("{0}")]
    Backend(String),
}

#[async_trait]
pub trait SecretsClient: Send + Sync {
    /// Data of a Secret or ConfigMap, `None` when the object does not exist
    async fn read(
        &self,
        namespace: &str,
        kind: DataSourceKind,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, SecretsError>;

    /// Create or replace the outputs secret, owned by the module
    async fn write_outputs(
        &self,
        tf: &Terraform,
        spec: &WriteOutputsToSecretSpec,
        data: BTreeMap<String, String>,
    ) -> Result<(), SecretsError>;

    /// Delete the outputs secret; a missing secret is not an error
    async fn delete_outputs(&self, namespace: &str, name: &str) -> Result<(), SecretsError>;

    /// Create or replace the readable plan ConfigMap
    async fn write_readable_plan(
        &self,
        tf: &Terraform,
        plan_id: &str,
        content: &str,
    ) -> Result<(), SecretsError>;
}

/// Name of the readable plan ConfigMap: `tfplan-{workspace}-{name}`
#[must_use]
pub fn readable_plan_name(tf: &Terraform) -> String {
    format!("tfplan-{}-{}", tf.spec.workspace, tf.name_any())
}

fn managed_labels(tf: &Terraform, extra: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([
        (CREATED_BY_LABEL.to_string(), CONTROLLER_NAME.to_string()),
        (TERRAFORM_NAME_LABEL.to_string(), tf.name_any()),
    ]);
    labels.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
    labels
}

#[derive(Clone)]
pub struct KubeSecretsClient {
    client: Client,
}

impl KubeSecretsClient {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretsClient for KubeSecretsClient {
    async fn read(
        &self,
        namespace: &str,
        kind: DataSourceKind,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, SecretsError> {
        match kind {
            DataSourceKind::Secret => {
                let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
                let Some(secret) = api.get_opt(name).await? else {
                    return Ok(None);
                };
                let mut data: BTreeMap<String, String> = secret
                    .data
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(k, v)| (k, String::from_utf8_lossy(&v.0).into_owned()))
                    .collect();
                data.extend(secret.string_data.unwrap_or_default());
                Ok(Some(data))
            }
            DataSourceKind::ConfigMap => {
                let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
                let Some(config_map) = api.get_opt(name).await? else {
                    return Ok(None);
                };
                Ok(Some(config_map.data.unwrap_or_default()))
            }
        }
    }

    async fn write_outputs(
        &self,
        tf: &Terraform,
        spec: &WriteOutputsToSecretSpec,
        data: BTreeMap<String, String>,
    ) -> Result<(), SecretsError> {
        let namespace = tf.namespace().unwrap_or_else(|| "default".to_string());
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(spec.name.clone()),
                namespace: Some(namespace.clone()),
                labels: Some(managed_labels(tf, &spec.labels)),
                annotations: (!spec.annotations.is_empty()).then(|| spec.annotations.clone()),
                owner_references: tf.controller_owner_ref(&()).map(|owner| vec![owner]),
                ..Default::default()
            },
            data: Some(
                data.into_iter()
                    .map(|(k, v)| (k, ByteString(v.into_bytes())))
                    .collect(),
            ),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        };
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        api.patch(
            &spec.name,
            &PatchParams::apply(CONTROLLER_NAME).force(),
            &Patch::Apply(&secret),
        )
        .await?;
        debug!(secret.name = %spec.name, secret.namespace = %namespace, "outputs.secret.written");
        Ok(())
    }

    async fn delete_outputs(&self, namespace: &str, name: &str) -> Result<(), SecretsError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(api_err)) if api_err.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_readable_plan(
        &self,
        tf: &Terraform,
        plan_id: &str,
        content: &str,
    ) -> Result<(), SecretsError> {
        let namespace = tf.namespace().unwrap_or_else(|| "default".to_string());
        let name = readable_plan_name(tf);
        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.clone()),
                labels: Some(managed_labels(tf, &BTreeMap::new())),
                annotations: Some(BTreeMap::from([(
                    "infra.contrib.fluxcd.io/plan-id".to_string(),
                    plan_id.to_string(),
                )])),
                owner_references: tf.controller_owner_ref(&()).map(|owner| vec![owner]),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                READABLE_PLAN_KEY.to_string(),
                content.to_string(),
            )])),
            ..Default::default()
        };
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &namespace);
        api.patch(
            &name,
            &PatchParams::apply(CONTROLLER_NAME).force(),
            &Patch::Apply(&config_map),
        )
        .await?;
        Ok(())
    }
}
