//! # Runner Pod Template
//!
//! Renders the runner pod for a module. Rendering is a pure function of the
//! module, the runner settings and the captured proxy environment; the
//! template hash label lets `ensure` reuse a pod rendered from identical input.

use crate::constants::{
    CONTROLLER_NAME, CREATED_BY_LABEL, RUNNER_CONTAINER_NAME, RUNNER_POD_SUFFIX,
    TEMPLATE_HASH_LABEL, TERRAFORM_NAME_LABEL,
};
use crate::controller::runner::env::{build_runner_env, builtin_env};
use crate::crd::{FileMappingLocation, Terraform};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, EnvVar, HTTPGetAction, KeyToPath, Pod,
    PodSpec, Probe, SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Home directory of the runner user
pub const RUNNER_HOME: &str = "/home/runner";

/// Scratch directory the runner unpacks the source artifact into
pub const RUNNER_WORKSPACE: &str = "/tmp/workspace";

/// Mount point of the CLI configuration secret
pub const CLI_CONFIG_MOUNT: &str = "/etc/tf-cli-config";

const DEFAULT_CLI_CONFIG_KEY: &str = "terraform.rc";

/// Controller-wide runner settings
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub image: String,
    pub port: u16,
    pub instance_id: String,
    pub grace_period_secs: i64,
}

/// `{name}-tf-runner`
#[must_use]
pub fn runner_pod_name(tf: &Terraform) -> String {
    format!("{}-{}", tf.name_any(), RUNNER_POD_SUFFIX)
}

/// Container environment for a module
///
/// User variables first in declared order, then proxy variables, then
/// built-ins; the latter two only when the name is not already present.
pub fn runner_env(tf: &Terraform, settings: &RunnerSettings, proxy: &[EnvVar]) -> Vec<EnvVar> {
    let user = tf
        .spec
        .runner_pod_template
        .as_ref()
        .map(|t| t.spec.env.as_slice())
        .unwrap_or_default();
    let cli_config_path = cli_config_path(tf);
    build_runner_env(
        user,
        proxy,
        &builtin_env(&settings.instance_id, cli_config_path.as_deref()),
    )
}

fn cli_config_path(tf: &Terraform) -> Option<String> {
    tf.spec.cli_config_secret_ref.as_ref().map(|reference| {
        let key = reference.key.as_deref().unwrap_or(DEFAULT_CLI_CONFIG_KEY);
        format!("{CLI_CONFIG_MOUNT}/{key}")
    })
}

/// Metadata maps: bookkeeping labels overlaid by template metadata
///
/// Template values win on collision, for labels and annotations independently.
pub fn runner_metadata(tf: &Terraform) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
    let mut labels = BTreeMap::from([
        (CREATED_BY_LABEL.to_string(), CONTROLLER_NAME.to_string()),
        (TERRAFORM_NAME_LABEL.to_string(), tf.name_any()),
    ]);
    let mut annotations = BTreeMap::new();
    if let Some(template) = &tf.spec.runner_pod_template {
        labels.extend(template.metadata.labels.clone());
        annotations.extend(template.metadata.annotations.clone());
    }
    (labels, annotations)
}

fn file_mapping_volumes(tf: &Terraform) -> (Vec<Volume>, Vec<VolumeMount>) {
    let mut volumes = Vec::new();
    let mut mounts = Vec::new();

    for (index, mapping) in tf.spec.file_mappings.iter().enumerate() {
        let volume_name = format!("file-mapping-{index}");
        let base = match mapping.location {
            FileMappingLocation::Home => RUNNER_HOME,
            FileMappingLocation::Workspace => RUNNER_WORKSPACE,
        };
        volumes.push(Volume {
            name: volume_name.clone(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(mapping.secret_ref.name.clone()),
                items: Some(vec![KeyToPath {
                    key: mapping.secret_ref.key.clone(),
                    path: mapping.secret_ref.key.clone(),
                    mode: None,
                }]),
                optional: Some(mapping.secret_ref.optional),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: volume_name,
            mount_path: format!("{}/{}", base, mapping.path.trim_start_matches('/')),
            sub_path: Some(mapping.secret_ref.key.clone()),
            read_only: Some(true),
            ..Default::default()
        });
    }

    if let Some(reference) = &tf.spec.cli_config_secret_ref {
        volumes.push(Volume {
            name: "cli-config".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(reference.name.clone()),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: "cli-config".to_string(),
            mount_path: CLI_CONFIG_MOUNT.to_string(),
            read_only: Some(true),
            ..Default::default()
        });
    }

    (volumes, mounts)
}

/// Pod spec of the runner
pub fn runner_pod_spec(tf: &Terraform, settings: &RunnerSettings, proxy: &[EnvVar]) -> PodSpec {
    let template = tf.spec.runner_pod_template.clone().unwrap_or_default().spec;
    let image = template
        .image
        .clone()
        .filter(|image| !image.is_empty())
        .unwrap_or_else(|| settings.image.clone());

    let mut volumes = vec![
        Volume {
            name: "temp".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
        Volume {
            name: "home".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
    ];
    let mut mounts = vec![
        VolumeMount {
            name: "temp".to_string(),
            mount_path: "/tmp".to_string(),
            ..Default::default()
        },
        VolumeMount {
            name: "home".to_string(),
            mount_path: RUNNER_HOME.to_string(),
            ..Default::default()
        },
    ];
    let (mapping_volumes, mapping_mounts) = file_mapping_volumes(tf);
    volumes.extend(mapping_volumes);
    volumes.extend(template.volumes.clone());
    mounts.extend(mapping_mounts);
    mounts.extend(template.volume_mounts.clone());

    let container = Container {
        name: RUNNER_CONTAINER_NAME.to_string(),
        image: Some(image),
        image_pull_policy: Some("IfNotPresent".to_string()),
        args: Some(vec!["--port".to_string(), settings.port.to_string()]),
        ports: Some(vec![ContainerPort {
            name: Some("http".to_string()),
            container_port: i32::from(settings.port),
            ..Default::default()
        }]),
        env: Some(runner_env(tf, settings, proxy)),
        env_from: (!template.env_from.is_empty()).then(|| template.env_from.clone()),
        volume_mounts: Some(mounts),
        readiness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/healthz".to_string()),
                port: IntOrString::Int(i32::from(settings.port)),
                ..Default::default()
            }),
            period_seconds: Some(2),
            ..Default::default()
        }),
        security_context: template.security_context.clone(),
        resources: template.resources.clone(),
        ..Default::default()
    };

    PodSpec {
        containers: vec![container],
        init_containers: (!template.init_containers.is_empty())
            .then(|| template.init_containers.clone()),
        service_account_name: Some(tf.spec.service_account_name.clone()),
        restart_policy: Some("Never".to_string()),
        termination_grace_period_seconds: Some(
            tf.spec
                .runner_termination_grace_period_seconds
                .unwrap_or(settings.grace_period_secs),
        ),
        node_selector: (!template.node_selector.is_empty()).then(|| template.node_selector.clone()),
        affinity: template.affinity.clone(),
        tolerations: (!template.tolerations.is_empty()).then(|| template.tolerations.clone()),
        host_aliases: (!template.host_aliases.is_empty()).then(|| template.host_aliases.clone()),
        priority_class_name: template.priority_class_name.clone(),
        volumes: Some(volumes),
        ..Default::default()
    }
}

/// Hash of the rendered spec and metadata, 16 hex characters
pub fn template_hash(
    spec: &PodSpec,
    labels: &BTreeMap<String, String>,
    annotations: &BTreeMap<String, String>,
) -> String {
    let rendered = serde_json::json!({
        "spec": spec,
        "labels": labels,
        "annotations": annotations,
    });
    let digest = Sha256::digest(rendered.to_string().as_bytes());
    digest
        .iter()
        .take(8)
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// Complete runner pod for a module
pub fn build_runner_pod(tf: &Terraform, settings: &RunnerSettings, proxy: &[EnvVar]) -> Pod {
    let spec = runner_pod_spec(tf, settings, proxy);
    let (mut labels, annotations) = runner_metadata(tf);
    let hash = template_hash(&spec, &labels, &annotations);
    labels.entry(TEMPLATE_HASH_LABEL.to_string()).or_insert(hash);

    Pod {
        metadata: ObjectMeta {
            name: Some(runner_pod_name(tf)),
            namespace: tf.namespace(),
            labels: Some(labels),
            annotations: (!annotations.is_empty()).then_some(annotations),
            owner_references: tf.controller_owner_ref(&()).map(|owner| vec![owner]),
            ..Default::default()
        },
        spec: Some(spec),
        status: None,
    }
}

/// Template hash label of a pod
#[must_use]
pub fn pod_template_hash(pod: &Pod) -> Option<&str> {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(TEMPLATE_HASH_LABEL))
        .map(String::as_str)
}
