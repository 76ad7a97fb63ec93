//! Common test utilities
//!
//! In-memory stand-ins for every collaborator of the reconciler, plus a
//! harness that wires them into a `Reconciler` and drives single ticks.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use async_trait::async_trait;
use kube::ResourceExt;
use kube_runtime::controller::Action;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tf_controller::config::ControllerConfig;
use tf_controller::controller::health::HealthChecker;
use tf_controller::controller::reconciler::{reconcile, Collaborators, Reconciler, ReconcilerError};
use tf_controller::controller::runner::{RunnerError, RunnerHandle, RunnerRuntime};
use tf_controller::controller::secrets::{SecretsClient, SecretsError};
use tf_controller::controller::session::{
    ApplyRequest, ApplyResult, DestroyRequest, ExecutionSession, InitRequest, LockInfo,
    OutputValue, PlanRequest, PlanResult, SessionError, SessionFactory,
};
use tf_controller::controller::source::{SourceArtifact, SourceError, SourceResolver, SourceState};
use tf_controller::controller::store::{ObjectKey, StatusStore, StoreError};
use tf_controller::controller::webhook::{GateDecision, PlanPayload, WebhookGate};
use tf_controller::crd::{
    DataSourceKind, HealthCheck, ResourceRef, Terraform, TerraformStatus, WebhookStage,
    WriteOutputsToSecretSpec,
};

pub const NAMESPACE: &str = "flux-system";
pub const REVISION: &str = "main@sha1:7680da431ea59ae7d3f4fdbb903a0f4509da9078";
pub const PLAN_ID: &str = "plan-main-7680da4";
pub const INSTANCE: &str = "tf-controller";

static RUSTLS_INIT: Once = Once::new();

/// Install the ring crypto provider once per test binary
pub fn init_rustls() {
    RUSTLS_INIT.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .expect("Failed to install rustls crypto provider");
    });
}

/// `Terraform` named `name` with a minimal valid spec merged with `extra`
pub fn terraform(name: &str, extra: Value) -> Terraform {
    let mut spec = serde_json::json!({
        "sourceRef": { "kind": "GitRepository", "name": "infra-repo" },
        "path": "./terraform/hello-world",
        "interval": "5m",
        "approvePlan": "auto"
    });
    if let (Some(spec), Some(extra)) = (spec.as_object_mut(), extra.as_object()) {
        spec.extend(extra.clone());
    }
    let mut tf = Terraform::new(name, serde_json::from_value(spec).expect("valid spec"));
    tf.metadata.namespace = Some(NAMESPACE.to_string());
    tf
}

pub fn key(name: &str) -> ObjectKey {
    ObjectKey::new(NAMESPACE, name)
}

// ---------------------------------------------------------------------------
// Status store
// ---------------------------------------------------------------------------

type Interleave = Box<dyn FnMut(&mut Terraform) + Send>;

/// Store with API-server-like resource versions
///
/// `interleave` runs a concurrent writer right before the next write lands,
/// which makes that write conflict.
#[derive(Default)]
pub struct FakeStore {
    objects: Mutex<HashMap<ObjectKey, Terraform>>,
    version: AtomicU64,
    interleave: Mutex<VecDeque<Interleave>>,
    pub status_writes: AtomicU32,
    pub conflicts: AtomicU32,
}

impl FakeStore {
    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    pub fn insert(&self, mut tf: Terraform) -> ObjectKey {
        if tf.metadata.namespace.is_none() {
            tf.metadata.namespace = Some(NAMESPACE.to_string());
        }
        tf.metadata.generation = tf.metadata.generation.or(Some(1));
        tf.metadata.uid = Some(format!("uid-{}", tf.name_any()));
        tf.metadata.resource_version = Some(self.next_version());
        let key = ObjectKey::from_resource(&tf);
        self.objects
            .lock()
            .expect("store lock")
            .insert(key.clone(), tf);
        key
    }

    pub fn object(&self, key: &ObjectKey) -> Option<Terraform> {
        self.objects.lock().expect("store lock").get(key).cloned()
    }

    pub fn status(&self, key: &ObjectKey) -> TerraformStatus {
        self.object(key)
            .and_then(|tf| tf.status)
            .unwrap_or_default()
    }

    /// Edit the spec the way `kubectl edit` does: new generation and version
    pub fn update_spec<F: FnOnce(&mut Terraform)>(&self, key: &ObjectKey, edit: F) {
        let mut objects = self.objects.lock().expect("store lock");
        let tf = objects.get_mut(key).expect("object exists");
        edit(tf);
        tf.metadata.generation = tf.metadata.generation.map(|g| g + 1);
        tf.metadata.resource_version = Some(self.next_version());
    }

    /// Edit metadata or status without bumping the generation
    pub fn update<F: FnOnce(&mut Terraform)>(&self, key: &ObjectKey, edit: F) {
        let mut objects = self.objects.lock().expect("store lock");
        let tf = objects.get_mut(key).expect("object exists");
        edit(tf);
        tf.metadata.resource_version = Some(self.next_version());
    }

    pub fn mark_deleted(&self, key: &ObjectKey) {
        self.update(key, |tf| {
            tf.metadata.deletion_timestamp = Some(
                serde_json::from_value(serde_json::json!("2024-05-01T12:00:00Z"))
                    .expect("valid time"),
            );
        });
    }

    /// Forget any retry wait so the next tick acts at once
    pub fn clear_retry_wait(&self, key: &ObjectKey) {
        self.update(key, |tf| {
            if let Some(status) = tf.status.as_mut() {
                status.retry_after = None;
            }
        });
    }

    pub fn interleave<F: FnMut(&mut Terraform) + Send + 'static>(&self, writer: F) {
        self.interleave
            .lock()
            .expect("interleave lock")
            .push_back(Box::new(writer));
    }

    fn compare_and_swap<F: FnOnce(&mut Terraform)>(
        &self,
        key: &ObjectKey,
        resource_version: &str,
        write: F,
    ) -> Result<Terraform, StoreError> {
        let concurrent = self.interleave.lock().expect("interleave lock").pop_front();
        let mut objects = self.objects.lock().expect("store lock");
        let Some(tf) = objects.get_mut(key) else {
            return Err(StoreError::NotFound(key.clone()));
        };
        if let Some(mut writer) = concurrent {
            writer(tf);
            tf.metadata.resource_version = Some(self.next_version());
        }
        if tf.metadata.resource_version.as_deref() != Some(resource_version) {
            self.conflicts.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Conflict(key.clone()));
        }
        write(tf);
        tf.metadata.resource_version = Some(self.next_version());
        let updated = tf.clone();

        // The API server drops a deleting object once its last finalizer is gone
        if updated.metadata.deletion_timestamp.is_some() && updated.finalizers().is_empty() {
            objects.remove(key);
        }
        Ok(updated)
    }
}

#[async_trait]
impl StatusStore for FakeStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<Terraform>, StoreError> {
        Ok(self.object(key))
    }

    async fn write_status(
        &self,
        key: &ObjectKey,
        resource_version: &str,
        status: &TerraformStatus,
    ) -> Result<Terraform, StoreError> {
        let updated = self.compare_and_swap(key, resource_version, |tf| {
            tf.status = Some(status.clone());
        })?;
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        Ok(updated)
    }

    async fn set_finalizers(
        &self,
        key: &ObjectKey,
        resource_version: &str,
        finalizers: Vec<String>,
    ) -> Result<Terraform, StoreError> {
        self.compare_and_swap(key, resource_version, |tf| {
            tf.metadata.finalizers = Some(finalizers);
        })
    }
}

// ---------------------------------------------------------------------------
// Runner pods
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeRunners {
    pods: Mutex<HashMap<String, RunnerHandle>>,
    generation: AtomicU32,
    pub created: AtomicU32,
    pub deleted: AtomicU32,
}

impl FakeRunners {
    fn new_handle(&self, tf: &Terraform) -> RunnerHandle {
        let instance = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        RunnerHandle {
            pod_name: format!("{}-tf-runner", tf.name_any()),
            uid: format!("pod-uid-{instance}"),
            endpoint: format!("http://10.0.0.{instance}:30000"),
        }
    }

    pub fn running(&self, name: &str) -> Option<RunnerHandle> {
        self.pods
            .lock()
            .expect("runner lock")
            .get(&format!("{name}-tf-runner"))
            .cloned()
    }

    /// Simulate the pod being recreated behind the controller's back
    pub fn replace(&self, tf: &Terraform) {
        let handle = self.new_handle(tf);
        self.pods
            .lock()
            .expect("runner lock")
            .insert(handle.pod_name.clone(), handle);
    }
}

#[async_trait]
impl RunnerRuntime for FakeRunners {
    async fn ensure(&self, tf: &Terraform) -> Result<RunnerHandle, RunnerError> {
        let name = format!("{}-tf-runner", tf.name_any());
        if let Some(handle) = self.pods.lock().expect("runner lock").get(&name) {
            return Ok(handle.clone());
        }
        let handle = self.new_handle(tf);
        self.created.fetch_add(1, Ordering::SeqCst);
        self.pods
            .lock()
            .expect("runner lock")
            .insert(name, handle.clone());
        Ok(handle)
    }

    async fn lookup(&self, tf: &Terraform) -> Result<Option<RunnerHandle>, RunnerError> {
        Ok(self.running(&tf.name_any()))
    }

    async fn teardown(&self, tf: &Terraform) -> Result<(), RunnerError> {
        let removed = self
            .pods
            .lock()
            .expect("runner lock")
            .remove(&format!("{}-tf-runner", tf.name_any()));
        if removed.is_some() {
            self.deleted.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Execution sessions
// ---------------------------------------------------------------------------

/// Scripted outcome of the next plan
#[derive(Debug, Clone)]
pub enum PlanOutcome {
    Changes,
    NoChanges,
    /// Destroy plan with changes
    Destroy,
    Fail(SessionError),
    /// Takes this long, then reports changes
    Slow(Duration),
}

/// Shared script and call log of every session the factory hands out
#[derive(Default)]
pub struct Script {
    pub plans: Mutex<VecDeque<PlanOutcome>>,
    pub apply_error: Mutex<Option<SessionError>>,
    pub unavailable: Mutex<Option<String>>,
    pub inventory: Mutex<Vec<ResourceRef>>,
    pub outputs: Mutex<BTreeMap<String, OutputValue>>,
    pub calls: Mutex<Vec<String>>,
    pub last_init: Mutex<Option<InitRequest>>,
    pub last_destroy: Mutex<Option<DestroyRequest>>,
}

impl Script {
    fn record(&self, call: impl Into<String>) {
        self.calls.lock().expect("calls lock").push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn push_plan(&self, outcome: PlanOutcome) {
        self.plans.lock().expect("plans lock").push_back(outcome);
    }
}

pub struct FakeSession {
    runner: RunnerHandle,
    script: Arc<Script>,
}

#[async_trait]
impl ExecutionSession for FakeSession {
    fn runner(&self) -> &RunnerHandle {
        &self.runner
    }

    async fn init(&self, request: &InitRequest) -> Result<(), SessionError> {
        self.script.record("init");
        *self.script.last_init.lock().expect("init lock") = Some(request.clone());
        Ok(())
    }

    async fn plan(&self, request: &PlanRequest) -> Result<PlanResult, SessionError> {
        self.script.record(format!("plan:{}", request.plan_id));
        let outcome = self
            .script
            .plans
            .lock()
            .expect("plans lock")
            .pop_front()
            .unwrap_or(PlanOutcome::Changes);
        let changes = PlanResult {
            has_changes: true,
            is_destroy: request.destroy,
            plan_id: request.plan_id.clone(),
            diff: "+ aws_s3_bucket.hello".to_string(),
            json: Some(serde_json::json!({"resource_changes": [{"address": "aws_s3_bucket.hello"}]})),
        };
        match outcome {
            PlanOutcome::Changes => Ok(changes),
            PlanOutcome::NoChanges => Ok(PlanResult {
                has_changes: false,
                plan_id: request.plan_id.clone(),
                ..Default::default()
            }),
            PlanOutcome::Destroy => Ok(PlanResult {
                is_destroy: true,
                diff: "- aws_s3_bucket.hello".to_string(),
                ..changes
            }),
            PlanOutcome::Fail(error) => Err(error),
            PlanOutcome::Slow(delay) => {
                tokio::time::sleep(delay).await;
                Ok(changes)
            }
        }
    }

    async fn apply(&self, request: &ApplyRequest) -> Result<ApplyResult, SessionError> {
        self.script.record(format!("apply:{}", request.plan_id));
        if let Some(error) = self.script.apply_error.lock().expect("apply lock").take() {
            return Err(error);
        }
        Ok(ApplyResult {
            inventory: self.script.inventory.lock().expect("inventory lock").clone(),
            outputs: self.script.outputs.lock().expect("outputs lock").clone(),
        })
    }

    async fn destroy(&self, request: &DestroyRequest) -> Result<(), SessionError> {
        self.script.record("destroy");
        *self.script.last_destroy.lock().expect("destroy lock") = Some(request.clone());
        Ok(())
    }

    async fn output(&self) -> Result<BTreeMap<String, OutputValue>, SessionError> {
        self.script.record("output");
        Ok(self.script.outputs.lock().expect("outputs lock").clone())
    }

    async fn force_unlock(&self, lock_id: &str) -> Result<(), SessionError> {
        self.script.record(format!("force-unlock:{lock_id}"));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeSessions {
    pub script: Arc<Script>,
}

#[async_trait]
impl SessionFactory for FakeSessions {
    async fn connect(&self, runner: &RunnerHandle) -> Result<Box<dyn ExecutionSession>, SessionError> {
        if let Some(reason) = self.script.unavailable.lock().expect("unavailable lock").clone() {
            return Err(SessionError::Unavailable(reason));
        }
        Ok(Box::new(FakeSession {
            runner: runner.clone(),
            script: Arc::clone(&self.script),
        }))
    }
}

pub fn backend_lock_error(id: &str) -> SessionError {
    SessionError::ExecutionFailed {
        message: "Error acquiring the state lock".to_string(),
        lock_info: Some(LockInfo {
            id: id.to_string(),
            who: Some("runner@ci".to_string()),
            operation: Some("OperationTypePlan".to_string()),
            created: None,
        }),
    }
}

// ---------------------------------------------------------------------------
// Sources, secrets, webhooks, health
// ---------------------------------------------------------------------------

pub struct FakeSources {
    pub state: Mutex<SourceState>,
}

impl Default for FakeSources {
    fn default() -> Self {
        Self {
            state: Mutex::new(SourceState::Ready(SourceArtifact {
                url: "http://source-controller.flux-system.svc/gitrepository/flux-system/infra-repo/7680da4.tar.gz"
                    .to_string(),
                revision: REVISION.to_string(),
            })),
        }
    }
}

impl FakeSources {
    pub fn set(&self, state: SourceState) {
        *self.state.lock().expect("source lock") = state;
    }
}

#[async_trait]
impl SourceResolver for FakeSources {
    async fn resolve(&self, _tf: &Terraform) -> Result<SourceState, SourceError> {
        Ok(self.state.lock().expect("source lock").clone())
    }
}

#[derive(Default)]
pub struct FakeSecrets {
    pub objects: Mutex<HashMap<(String, DataSourceKind, String), BTreeMap<String, String>>>,
    pub outputs: Mutex<HashMap<String, BTreeMap<String, String>>>,
    pub deleted_outputs: Mutex<Vec<String>>,
    pub readable_plans: Mutex<HashMap<String, String>>,
    pub fail_output_writes: Mutex<bool>,
}

impl FakeSecrets {
    pub fn put(&self, kind: DataSourceKind, name: &str, data: &[(&str, &str)]) {
        self.objects.lock().expect("secrets lock").insert(
            (NAMESPACE.to_string(), kind, name.to_string()),
            data.iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        );
    }
}

#[async_trait]
impl SecretsClient for FakeSecrets {
    async fn read(
        &self,
        namespace: &str,
        kind: DataSourceKind,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, SecretsError> {
        Ok(self
            .objects
            .lock()
            .expect("secrets lock")
            .get(&(namespace.to_string(), kind, name.to_string()))
            .cloned())
    }

    async fn write_outputs(
        &self,
        _tf: &Terraform,
        spec: &WriteOutputsToSecretSpec,
        data: BTreeMap<String, String>,
    ) -> Result<(), SecretsError> {
        if *self.fail_output_writes.lock().expect("secrets lock") {
            return Err(SecretsError::Backend("secrets is forbidden".to_string()));
        }
        self.outputs
            .lock()
            .expect("secrets lock")
            .insert(spec.name.clone(), data);
        Ok(())
    }

    async fn delete_outputs(&self, _namespace: &str, name: &str) -> Result<(), SecretsError> {
        self.outputs.lock().expect("secrets lock").remove(name);
        self.deleted_outputs
            .lock()
            .expect("secrets lock")
            .push(name.to_string());
        Ok(())
    }

    async fn write_readable_plan(
        &self,
        _tf: &Terraform,
        plan_id: &str,
        content: &str,
    ) -> Result<(), SecretsError> {
        self.readable_plans
            .lock()
            .expect("secrets lock")
            .insert(plan_id.to_string(), content.to_string());
        Ok(())
    }
}

pub struct FakeWebhooks {
    pub decision: Mutex<GateDecision>,
    pub calls: AtomicU32,
}

impl Default for FakeWebhooks {
    fn default() -> Self {
        Self {
            decision: Mutex::new(GateDecision::Allow),
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl WebhookGate for FakeWebhooks {
    async fn evaluate(&self, _tf: &Terraform, _stage: WebhookStage, _plan: &PlanPayload) -> GateDecision {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.decision.lock().expect("webhook lock").clone()
    }
}

pub struct FakeHealth {
    pub result: Mutex<Result<(), String>>,
}

impl Default for FakeHealth {
    fn default() -> Self {
        Self {
            result: Mutex::new(Ok(())),
        }
    }
}

#[async_trait]
impl HealthChecker for FakeHealth {
    async fn check(&self, _checks: &[HealthCheck], _outputs: &Value) -> Result<(), String> {
        self.result.lock().expect("health lock").clone()
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub store: Arc<FakeStore>,
    pub runners: Arc<FakeRunners>,
    pub sessions: Arc<FakeSessions>,
    pub sources: Arc<FakeSources>,
    pub secrets: Arc<FakeSecrets>,
    pub webhooks: Arc<FakeWebhooks>,
    pub health: Arc<FakeHealth>,
    pub reconciler: Arc<Reconciler>,
}

fn empty_collaborators() -> Collaborators {
    Collaborators {
        store: Arc::new(FakeStore::default()),
        runners: Arc::new(FakeRunners::default()),
        sessions: Arc::new(FakeSessions::default()),
        sources: Arc::new(FakeSources::default()),
        secrets: Arc::new(FakeSecrets::default()),
        webhooks: Arc::new(FakeWebhooks::default()),
        health: Arc::new(FakeHealth::default()),
    }
}

pub fn test_config(instance: &str) -> ControllerConfig {
    ControllerConfig {
        instance_id: instance.to_string(),
        cancel_poll_interval_ms: 20,
        ..ControllerConfig::default()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config(INSTANCE))
    }

    pub fn with_config(config: ControllerConfig) -> Self {
        Self::build(
            Arc::default(),
            Arc::default(),
            Arc::default(),
            Arc::default(),
            config,
        )
    }

    /// Second controller instance over the same cluster: store, pods and sources
    pub fn peer(&self, instance: &str) -> Self {
        Self::build(
            Arc::clone(&self.store),
            Arc::clone(&self.runners),
            Arc::clone(&self.sessions),
            Arc::clone(&self.sources),
            test_config(instance),
        )
    }

    fn build(
        store: Arc<FakeStore>,
        runners: Arc<FakeRunners>,
        sessions: Arc<FakeSessions>,
        sources: Arc<FakeSources>,
        config: ControllerConfig,
    ) -> Self {
        let mut harness = Self {
            store,
            runners,
            sessions,
            sources,
            secrets: Arc::default(),
            webhooks: Arc::default(),
            health: Arc::default(),
            reconciler: Arc::new(Reconciler::new(empty_collaborators(), config.clone())),
        };
        harness.reconciler = Arc::new(Reconciler::new(harness.collaborators(), config));
        harness
    }

    fn collaborators(&self) -> Collaborators {
        Collaborators {
            store: Arc::clone(&self.store) as Arc<dyn StatusStore>,
            runners: Arc::clone(&self.runners) as Arc<dyn RunnerRuntime>,
            sessions: Arc::clone(&self.sessions) as Arc<dyn SessionFactory>,
            sources: Arc::clone(&self.sources) as Arc<dyn SourceResolver>,
            secrets: Arc::clone(&self.secrets) as Arc<dyn SecretsClient>,
            webhooks: Arc::clone(&self.webhooks) as Arc<dyn WebhookGate>,
            health: Arc::clone(&self.health) as Arc<dyn HealthChecker>,
        }
    }

    pub fn script(&self) -> &Script {
        &self.sessions.script
    }

    /// Run one reconcile of `key` the way the watch loop would
    pub async fn tick(&self, key: &ObjectKey) -> Result<Action, ReconcilerError> {
        let trigger = self
            .store
            .object(key)
            .unwrap_or_else(|| terraform(&key.name, serde_json::json!({})));
        reconcile(Arc::new(trigger), Arc::clone(&self.reconciler)).await
    }

    /// Tick and expect success
    pub async fn step(&self, key: &ObjectKey) -> Action {
        match self.tick(key).await {
            Ok(action) => action,
            Err(e) => panic!("reconcile of {key} failed: {e}"),
        }
    }
}

/// Status value of condition `condition_type`, with its reason
pub fn condition(status: &TerraformStatus, condition_type: &str) -> Option<(String, String)> {
    status
        .condition(condition_type)
        .map(|c| (c.status.clone(), c.reason.clone().unwrap_or_default()))
}

pub fn ready(status: &TerraformStatus) -> Option<(String, String)> {
    condition(status, "Ready")
}

pub fn pair(status: &str, reason: &str) -> Option<(String, String)> {
    Some((status.to_string(), reason.to_string()))
}
