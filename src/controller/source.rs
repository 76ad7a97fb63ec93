//! # Source Resolution
//!
//! Resolves a module's `sourceRef` to the artifact published by Flux
//! source-controller. The revision is the change-detection key: a new revision
//! makes any pending plan stale.

use crate::crd::{CrossNamespaceSourceReference, Terraform};
use async_trait::async_trait;
use kube::api::ApiResource;
use kube::core::{DynamicObject, GroupVersionKind};
use kube::{Api, Client, ResourceExt};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

const SOURCE_GROUP: &str = "source.toolkit.fluxcd.io";

/// Artifact published for a source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceArtifact {
    /// HTTP URL of the tarball served by source-controller
    pub url: String,
    /// Revision, e.g. `main@sha1:7680da431ea59ae7d3f4fdbb903a0f4509da9078`
    pub revision: String,
}

impl SourceArtifact {
    /// Short form used in plan identifiers: `main-7680da4`
    #[must_use]
    pub fn short_revision(&self) -> String {
        short_revision(&self.revision)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceState {
    Ready(SourceArtifact),
    NotReady(String),
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to read source {kind} {namespace}/{name}: {source}")]
    Kube {
        kind: String,
        namespace: String,
        name: String,
        #[source]
        source: kube::Error,
    },
    #[error("invalid source reference: {0}")]
    Invalid(String),
}

#[async_trait]
pub trait SourceResolver: Send + Sync {
    async fn resolve(&self, tf: &Terraform) -> Result<SourceState, SourceError>;
}

/// Reads `status.artifact` of GitRepository, Bucket and OCIRepository objects
#[derive(Clone)]
pub struct FluxSourceResolver {
    client: Client,
}

impl FluxSourceResolver {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Group/version/kind of a source reference
pub fn source_gvk(source_ref: &CrossNamespaceSourceReference) -> Result<GroupVersionKind, SourceError> {
    let (group, version) = match source_ref.api_version.as_deref() {
        Some(api_version) => match api_version.split_once('/') {
            Some((group, version)) => (group.to_string(), version.to_string()),
            None => {
                return Err(SourceError::Invalid(format!(
                    "apiVersion '{api_version}' has no group"
                )))
            }
        },
        None => {
            let version = match source_ref.kind.as_str() {
                "GitRepository" => "v1",
                "Bucket" | "OCIRepository" => "v1beta2",
                other => {
                    return Err(SourceError::Invalid(format!(
                        "unsupported source kind '{other}'"
                    )))
                }
            };
            (SOURCE_GROUP.to_string(), version.to_string())
        }
    };
    Ok(GroupVersionKind {
        group,
        version,
        kind: source_ref.kind.clone(),
    })
}

/// Source state from a source object's JSON
pub fn source_state_from_object(object: &serde_json::Value) -> SourceState {
    let status = object.get("status");
    let ready = status
        .and_then(|s| s.get("conditions"))
        .and_then(|c| c.as_array())
        .and_then(|conditions| {
            conditions
                .iter()
                .find(|c| c.get("type").and_then(|t| t.as_str()) == Some("Ready"))
        });
    if let Some(ready) = ready {
        if ready.get("status").and_then(|s| s.as_str()) != Some("True") {
            let message = ready
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("source is not ready");
            return SourceState::NotReady(message.to_string());
        }
    }

    let artifact = status.and_then(|s| s.get("artifact"));
    let url = artifact.and_then(|a| a.get("url")).and_then(|u| u.as_str());
    let revision = artifact
        .and_then(|a| a.get("revision"))
        .and_then(|r| r.as_str());
    match (url, revision) {
        (Some(url), Some(revision)) if !url.is_empty() && !revision.is_empty() => {
            SourceState::Ready(SourceArtifact {
                // source-controller sometimes reports `cluster.local./path`
                url: url.replace("./", "/"),
                revision: revision.to_string(),
            })
        }
        _ => SourceState::NotReady("source has no artifact yet".to_string()),
    }
}

/// `main@sha1:7680da4...` becomes `main-7680da4`; bare digests keep 7 characters
#[must_use]
pub fn short_revision(revision: &str) -> String {
    let (branch, digest) = match revision.split_once('@') {
        Some((branch, digest)) => (Some(branch), digest),
        None => (None, revision),
    };
    let digest = digest
        .split_once(':')
        .map_or(digest, |(_, hex)| hex);
    let short: String = digest.chars().take(7).collect();
    match branch {
        Some(branch) if !branch.is_empty() => {
            format!("{}-{}", branch.replace('/', "-"), short)
        }
        _ => short,
    }
}

#[async_trait]
impl SourceResolver for FluxSourceResolver {
    async fn resolve(&self, tf: &Terraform) -> Result<SourceState, SourceError> {
        let source_ref = &tf.spec.source_ref;
        let namespace = source_ref
            .namespace
            .clone()
            .or_else(|| tf.namespace())
            .unwrap_or_else(|| "default".to_string());
        let gvk = source_gvk(source_ref)?;

        let span = info_span!(
            "source.resolve",
            source.kind = %source_ref.kind,
            source.name = %source_ref.name,
            source.namespace = %namespace
        );
        async move {
            let start = Instant::now();
            let ar = ApiResource::from_gvk(&gvk);
            let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), &namespace, &ar);
            let object = api
                .get_opt(&source_ref.name)
                .await
                .map_err(|source| SourceError::Kube {
                    kind: source_ref.kind.clone(),
                    namespace: namespace.clone(),
                    name: source_ref.name.clone(),
                    source,
                })?;
            debug!(duration_ms = start.elapsed().as_millis() as u64, "source.lookup.complete");

            let Some(object) = object else {
                return Ok(SourceState::NotReady(format!(
                    "{} '{}/{}' not found",
                    source_ref.kind, namespace, source_ref.name
                )));
            };
            Ok(source_state_from_object(&object.data))
        }
        .instrument(span)
        .await
    }
}
