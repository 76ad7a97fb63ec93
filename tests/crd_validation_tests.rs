//! # CRD Validation Tests
//!
//! Sample manifests must deserialize into the expected spec, and the
//! generated CustomResourceDefinition must keep the names, columns and schema
//! hints the cluster relies on.

use kube::core::CustomResourceExt;
use serde_json::json;
use tf_controller::crd::{
    ApprovalMode, DataSourceKind, FileMappingLocation, HealthCheckType, PayloadType, Phase,
    ReadablePlanFormat, Terraform, WebhookStage,
};

/// Every optional field left out
#[test]
fn test_minimal_manifest_takes_defaults() {
    let yaml = r#"
apiVersion: infra.contrib.fluxcd.io/v1alpha1
kind: Terraform
metadata:
  name: hello-world
  namespace: flux-system
spec:
  sourceRef:
    name: infra-repo
"#;
    let tf: Terraform = serde_yaml::from_str(yaml).expect("Should deserialize minimal manifest");

    assert_eq!(tf.spec.source_ref.kind, "GitRepository");
    assert_eq!(tf.spec.interval, "5m");
    assert_eq!(tf.spec.workspace, "default");
    assert_eq!(tf.spec.service_account_name, "tf-runner");
    assert_eq!(tf.spec.retry_interval_or_default(), "15s");
    assert_eq!(tf.spec.approval_mode(), ApprovalMode::Disabled);
    assert_eq!(tf.spec.store_readable_plan, ReadablePlanFormat::None);
    assert!(tf.spec.drift_detection_enabled());
    assert!(!tf.spec.auto_correct_drift());
    assert!(tf.spec.cleanup_runner_pod());
    assert!(!tf.spec.suspend);
    assert!(tf.status.is_none());
}

/// Every field set
#[test]
fn test_full_manifest() {
    let yaml = r#"
apiVersion: infra.contrib.fluxcd.io/v1alpha1
kind: Terraform
metadata:
  name: hello-world
  namespace: flux-system
  annotations:
    reconcile.fluxcd.io/requestedAt: "2024-05-01T12:00:00Z"
spec:
  interval: 1m
  retryInterval: 30s
  approvePlan: auto
  path: ./terraform/hello-world
  sourceRef:
    kind: OCIRepository
    name: infra-oci
    namespace: platform
  workspace: staging
  backendConfig:
    secretSuffix: hello
    inClusterConfig: true
    labels:
      team: infra
    state:
      forceUnlock: "no"
      lockTimeout: 2m
  backendConfigsFrom:
    - kind: Secret
      name: backend-extra
      keys: [bucket]
      optional: true
  vars:
    - name: replicas
      value: 3
    - name: tags
      value:
        owner: infra
    - name: token
      valueFrom:
        secretKeyRef:
          name: api
          key: token
  varsFrom:
    - kind: ConfigMap
      name: settings
      varsKeys: ["size:instance_size"]
  values:
    nested:
      list: [1, 2]
  fileMappings:
    - location: workspace
      path: credentials.json
      secretRef:
        name: gcp
        key: credentials.json
  readInputsFromSecrets:
    - name: network-outputs
      as: network
  writeOutputsToSecret:
    name: hello-world-outputs
    outputs: ["bucket", "arn:bucket_arn"]
  cliConfigSecretRef:
    name: tf-cli
  healthChecks:
    - name: web
      type: http
      url: https://${{ .endpoint }}/health
      timeout: 5s
  webhooks:
    - stage: post-planning
      url: https://policy.local/check
      payloadType: PlanOnly
      testExpression: "${{ .passed }}"
      errorMessageTemplate: "${{ .message }}"
  dependsOn:
    - name: network
  targets: ["aws_s3_bucket.hello"]
  alwaysCleanupRunnerPod: false
  runnerTerminationGracePeriodSeconds: 60
  runnerPodTemplate:
    metadata:
      labels:
        team: infra
    spec:
      image: registry.local/tf-runner:custom
      env:
        - name: TF_LOG
          value: debug
  serviceAccountName: custom-runner
  storeReadablePlan: human
  driftDetectionInterval: 10m
  autoCorrectDrift: false
  parallelism: 4
  refreshBeforeApply: true
"#;
    let tf: Terraform = serde_yaml::from_str(yaml).expect("Should deserialize full manifest");
    let spec = &tf.spec;

    assert_eq!(spec.source_ref.namespace.as_deref(), Some("platform"));
    assert_eq!(spec.approval_mode(), ApprovalMode::Auto);
    assert_eq!(spec.force_unlock_token(), Some("no"));
    assert_eq!(spec.backend_configs_from[0].kind, DataSourceKind::Secret);
    assert_eq!(spec.vars[0].value, Some(json!(3)));
    assert_eq!(spec.vars[1].value, Some(json!({"owner": "infra"})));
    assert!(spec.vars[2]
        .value_from
        .as_ref()
        .is_some_and(|source| source.secret_key_ref.is_some()));
    assert_eq!(spec.vars_from[0].vars_keys, vec!["size:instance_size"]);
    assert_eq!(spec.values, Some(json!({"nested": {"list": [1, 2]}})));
    assert_eq!(spec.file_mappings[0].location, FileMappingLocation::Workspace);
    assert_eq!(spec.read_inputs_from_secrets[0].as_name, "network");
    assert_eq!(spec.health_checks[0].check_type, HealthCheckType::Http);
    assert_eq!(spec.webhooks[0].stage, WebhookStage::PostPlanning);
    assert_eq!(spec.webhooks[0].payload_type, PayloadType::PlanOnly);
    assert!(spec.webhooks[0].is_enabled());
    assert!(!spec.cleanup_runner_pod());
    assert!(!spec.auto_correct_drift());
    assert_eq!(spec.store_readable_plan, ReadablePlanFormat::Human);
    assert_eq!(tf.reconcile_request(), Some("2024-05-01T12:00:00Z"));
    assert!(tf.has_new_reconcile_request());
}

#[test]
fn test_status_round_trips_through_yaml() {
    let yaml = r#"
apiVersion: infra.contrib.fluxcd.io/v1alpha1
kind: Terraform
metadata:
  name: hello-world
spec:
  sourceRef:
    name: infra-repo
status:
  phase: AwaitingApproval
  observedGeneration: 3
  failureCount: 1
  plan:
    pending: plan-main-7680da4
    isDriftDetectionOnly: false
  lock:
    holder: tf-controller
    acquiredAt: "2024-05-01T12:00:00Z"
  conditions:
    - type: Ready
      status: "False"
      reason: ApprovalRequired
      message: 'Plan generated: set approvePlan: "plan-main-7680da4" to approve this plan.'
"#;
    let tf: Terraform = serde_yaml::from_str(yaml).expect("Should deserialize status");
    let status = tf.status.expect("status present");

    assert_eq!(status.phase, Some(Phase::AwaitingApproval));
    assert_eq!(status.pending_plan(), Some("plan-main-7680da4"));
    assert!(status.lock.as_ref().is_some_and(|lock| lock.is_held()));
    assert!(!status.is_ready_at(Some(3)));
    assert!(status.inventory_is_empty());
}

#[test]
fn test_unknown_phase_is_rejected() {
    let result: Result<Phase, _> = serde_json::from_value(json!("Exploding"));
    assert!(result.is_err());
}

#[test]
fn test_generated_crd_names_and_columns() {
    let crd = Terraform::crd();
    assert_eq!(crd.metadata.name.as_deref(), Some("terraforms.infra.contrib.fluxcd.io"));
    assert_eq!(crd.spec.group, "infra.contrib.fluxcd.io");
    assert_eq!(crd.spec.names.kind, "Terraform");
    assert_eq!(crd.spec.names.plural, "terraforms");
    assert_eq!(crd.spec.names.short_names, Some(vec!["tf".to_string()]));
    assert_eq!(crd.spec.scope, "Namespaced");

    let version = &crd.spec.versions[0];
    assert_eq!(version.name, "v1alpha1");
    assert!(version.subresources.as_ref().is_some_and(|s| s.status.is_some()));
    let columns: Vec<&str> = version
        .additional_printer_columns
        .as_ref()
        .expect("printer columns")
        .iter()
        .map(|c| c.name.as_str())
        .collect();
    assert_eq!(columns, vec!["Phase", "Ready", "Status", "Age"]);
}

#[test]
fn test_generated_crd_keeps_free_form_values() {
    let yaml = serde_yaml::to_string(&Terraform::crd()).expect("CRD renders as YAML");
    assert!(yaml.contains("x-kubernetes-preserve-unknown-fields: true"));
    assert!(yaml.contains("approvePlan"));
    assert!(yaml.contains("runnerPodTemplate"));
}
