//! # Status Store
//!
//! Read and compare-and-swap access to `Terraform` objects.
//!
//! The reconciler never writes a remembered copy back. Every status change is
//! a pure mutator applied by [`patch_status`] to a fresh read, submitted with
//! the resource version of that read, and retried from a new read when another
//! writer got there first.

use crate::crd::{Terraform, TerraformStatus};
use crate::observability;
use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

/// Namespace and name of a module
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    #[must_use]
    pub fn from_resource(tf: &Terraform) -> Self {
        Self {
            namespace: tf.namespace().unwrap_or_else(|| "default".to_string()),
            name: tf.name_any(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Terraform {0} not found")]
    NotFound(ObjectKey),
    #[error("resource version conflict on {0}")]
    Conflict(ObjectKey),
    #[error("update of {key} gave up after {attempts} conflicting attempts")]
    ConflictRetriesExhausted { key: ObjectKey, attempts: u32 },
    #[error("Kubernetes API request failed: {0}")]
    Kube(#[from] kube::Error),
    #[error("store request failed: {0}")]
    Backend(String),
}

/// Object store with optimistic-concurrency writes
///
/// Writes carry the resource version the caller read. A mismatch fails with
/// [`StoreError::Conflict`] and nothing is written.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Current object, or `None` when it does not exist
    async fn get(&self, key: &ObjectKey) -> Result<Option<Terraform>, StoreError>;

    /// Replace the status if the object is still at `resource_version`
    async fn write_status(
        &self,
        key: &ObjectKey,
        resource_version: &str,
        status: &TerraformStatus,
    ) -> Result<Terraform, StoreError>;

    /// Replace the finalizer list if the object is still at `resource_version`
    async fn set_finalizers(
        &self,
        key: &ObjectKey,
        resource_version: &str,
        finalizers: Vec<String>,
    ) -> Result<Terraform, StoreError>;
}

/// Apply `mutate` to the freshest status of `key` and persist it
///
/// The mutator receives the freshly read object and a copy of its status. It
/// must be pure: on a conflict it is called again against a new read. When the
/// mutated status equals the stored one nothing is written.
pub async fn patch_status<F>(
    store: &dyn StatusStore,
    key: &ObjectKey,
    retry_limit: u32,
    mutate: F,
) -> Result<Terraform, StoreError>
where
    F: Fn(&Terraform, &mut TerraformStatus),
{
    let attempts = retry_limit.max(1);
    for attempt in 1..=attempts {
        let Some(current) = store.get(key).await? else {
            return Err(StoreError::NotFound(key.clone()));
        };
        let previous = current.status.clone().unwrap_or_default();
        let mut next = previous.clone();
        mutate(&current, &mut next);

        if next == previous {
            return Ok(current);
        }

        let resource_version = current.resource_version().unwrap_or_default();
        match store.write_status(key, &resource_version, &next).await {
            Ok(updated) => return Ok(updated),
            Err(StoreError::Conflict(_)) => {
                observability::metrics::increment_status_conflicts();
                debug!(
                    resource = %key,
                    attempt,
                    "Status patch conflicted, retrying from a fresh read"
                );
            }
            Err(e) => return Err(e),
        }
    }

    warn!(resource = %key, attempts, "Status patch gave up after repeated conflicts");
    Err(StoreError::ConflictRetriesExhausted {
        key: key.clone(),
        attempts,
    })
}

/// Add the controller finalizer if absent
pub async fn ensure_finalizer(
    store: &dyn StatusStore,
    key: &ObjectKey,
    finalizer: &str,
    retry_limit: u32,
) -> Result<Terraform, StoreError> {
    update_finalizers(store, key, retry_limit, |finalizers| {
        if finalizers.iter().any(|f| f == finalizer) {
            return false;
        }
        finalizers.push(finalizer.to_string());
        true
    })
    .await
}

/// Remove the controller finalizer; a missing object counts as done
pub async fn remove_finalizer(
    store: &dyn StatusStore,
    key: &ObjectKey,
    finalizer: &str,
    retry_limit: u32,
) -> Result<(), StoreError> {
    let result = update_finalizers(store, key, retry_limit, |finalizers| {
        let before = finalizers.len();
        finalizers.retain(|f| f != finalizer);
        finalizers.len() != before
    })
    .await;
    match result {
        Ok(_) | Err(StoreError::NotFound(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

async fn update_finalizers<F>(
    store: &dyn StatusStore,
    key: &ObjectKey,
    retry_limit: u32,
    edit: F,
) -> Result<Terraform, StoreError>
where
    F: Fn(&mut Vec<String>) -> bool,
{
    let attempts = retry_limit.max(1);
    for _ in 0..attempts {
        let Some(current) = store.get(key).await? else {
            return Err(StoreError::NotFound(key.clone()));
        };
        let mut finalizers = current.finalizers().to_vec();
        if !edit(&mut finalizers) {
            return Ok(current);
        }
        let resource_version = current.resource_version().unwrap_or_default();
        match store.set_finalizers(key, &resource_version, finalizers).await {
            Ok(updated) => return Ok(updated),
            Err(StoreError::Conflict(_)) => observability::metrics::increment_status_conflicts(),
            Err(e) => return Err(e),
        }
    }
    Err(StoreError::ConflictRetriesExhausted {
        key: key.clone(),
        attempts,
    })
}

/// [`StatusStore`] backed by the Kubernetes API
///
/// Writes are merge patches carrying `metadata.resourceVersion`, which the API
/// server treats as a precondition and answers with 409 on mismatch.
#[derive(Clone)]
pub struct KubeStatusStore {
    client: Client,
}

impl KubeStatusStore {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, key: &ObjectKey) -> Api<Terraform> {
        Api::namespaced(self.client.clone(), &key.namespace)
    }
}

fn classify(key: &ObjectKey, error: kube::Error) -> StoreError {
    match error {
        kube::Error::Api(ref api_err) if api_err.code == 409 => StoreError::Conflict(key.clone()),
        kube::Error::Api(ref api_err) if api_err.code == 404 => StoreError::NotFound(key.clone()),
        other => StoreError::Kube(other),
    }
}

#[async_trait]
impl StatusStore for KubeStatusStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<Terraform>, StoreError> {
        self.api(key)
            .get_opt(&key.name)
            .await
            .map_err(|e| classify(key, e))
    }

    async fn write_status(
        &self,
        key: &ObjectKey,
        resource_version: &str,
        status: &TerraformStatus,
    ) -> Result<Terraform, StoreError> {
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": resource_version },
            "status": status,
        });
        self.api(key)
            .patch_status(
                &key.name,
                &PatchParams::default(),
                &Patch::Merge(patch),
            )
            .await
            .map_err(|e| classify(key, e))
    }

    async fn set_finalizers(
        &self,
        key: &ObjectKey,
        resource_version: &str,
        finalizers: Vec<String>,
    ) -> Result<Terraform, StoreError> {
        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": resource_version,
                "finalizers": finalizers,
            },
        });
        self.api(key)
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| classify(key, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key_display() {
        let key = ObjectKey::new("flux-system", "hello-world");
        assert_eq!(key.to_string(), "flux-system/hello-world");
    }
}
