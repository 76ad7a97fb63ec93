//! # Runner Pod Manager
//!
//! Creates, polls and deletes the runner pod that executes a module.
//!
//! - `env.rs` - Ordered container environment (user, proxy, built-in)
//! - `template.rs` - Pod rendering and the template hash

pub mod env;
pub mod template;

use crate::crd::Terraform;
use crate::observability;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{EnvVar, Pod};
use kube::api::{Api, DeleteParams, PostParams};
use kube::{Client, ResourceExt};
use std::time::Duration;
use template::{build_runner_pod, pod_template_hash, runner_pod_name, RunnerSettings};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

/// Live runner bound to one pod instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerHandle {
    pub pod_name: String,
    /// Pod UID; a plan is only applied on the pod instance that produced it
    pub uid: String,
    /// Base URL of the runner's session API, e.g. `http://10.0.0.12:30000`
    pub endpoint: String,
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("runner pod {pod} not ready after {timeout:?}")]
    NotReady { pod: String, timeout: Duration },
    #[error("runner pod {pod} failed: {reason}")]
    Failed { pod: String, reason: String },
    #[error("deleting runner pod {pod} timed out after {timeout:?}")]
    TeardownTimeout { pod: String, timeout: Duration },
    #[error("Kubernetes API request failed: {0}")]
    Kube(#[from] kube::Error),
    #[error("{0}")]
    Backend(String),
}

/// Lifecycle of the runner pod of a module
#[async_trait]
pub trait RunnerRuntime: Send + Sync {
    /// Live runner matching the module's current template, creating it if needed
    async fn ensure(&self, tf: &Terraform) -> Result<RunnerHandle, RunnerError>;

    /// Current live runner, without creating one
    async fn lookup(&self, tf: &Terraform) -> Result<Option<RunnerHandle>, RunnerError>;

    /// Best-effort deletion bounded by the teardown timeout
    async fn teardown(&self, tf: &Terraform) -> Result<(), RunnerError>;
}

/// Timing of the Kubernetes runner runtime
#[derive(Debug, Clone)]
pub struct RunnerTimeouts {
    pub ready: Duration,
    pub poll: Duration,
    pub teardown: Duration,
}

/// [`RunnerRuntime`] creating pods through the Kubernetes API
pub struct KubeRunnerRuntime {
    client: Client,
    settings: RunnerSettings,
    timeouts: RunnerTimeouts,
    /// Proxy variables captured from the controller process at startup
    proxy_env: Vec<EnvVar>,
}

impl KubeRunnerRuntime {
    #[must_use]
    pub fn new(
        client: Client,
        settings: RunnerSettings,
        timeouts: RunnerTimeouts,
        proxy_env: Vec<EnvVar>,
    ) -> Self {
        Self {
            client,
            settings,
            timeouts,
            proxy_env,
        }
    }

    fn api(&self, tf: &Terraform) -> Api<Pod> {
        let namespace = tf.namespace().unwrap_or_else(|| "default".to_string());
        Api::namespaced(self.client.clone(), &namespace)
    }

    fn handle(&self, pod: &Pod) -> Option<RunnerHandle> {
        let status = pod.status.as_ref()?;
        let ip = status.pod_ip.as_deref().filter(|ip| !ip.is_empty())?;
        Some(RunnerHandle {
            pod_name: pod.name_any(),
            uid: pod.uid()?,
            endpoint: format!("http://{}:{}", ip, self.settings.port),
        })
    }

    async fn wait_until_gone(&self, api: &Api<Pod>, name: &str) -> Result<(), RunnerError> {
        let wait = async {
            loop {
                match api.get_opt(name).await? {
                    None => return Ok::<(), RunnerError>(()),
                    Some(_) => tokio::time::sleep(self.timeouts.poll).await,
                }
            }
        };
        tokio::time::timeout(self.timeouts.teardown, wait)
            .await
            .map_err(|_| RunnerError::TeardownTimeout {
                pod: name.to_string(),
                timeout: self.timeouts.teardown,
            })?
    }

    async fn delete(&self, api: &Api<Pod>, name: &str) -> Result<(), RunnerError> {
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                observability::metrics::increment_runner_pods_deleted();
                Ok(())
            }
            Err(kube::Error::Api(api_err)) if api_err.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn wait_ready(&self, api: &Api<Pod>, name: &str) -> Result<RunnerHandle, RunnerError> {
        let wait = async {
            loop {
                if let Some(pod) = api.get_opt(name).await? {
                    match pod_readiness(&pod) {
                        PodReadiness::Ready => {
                            if let Some(handle) = self.handle(&pod) {
                                return Ok::<RunnerHandle, RunnerError>(handle);
                            }
                        }
                        PodReadiness::Terminated(reason) => {
                            return Err(RunnerError::Failed {
                                pod: name.to_string(),
                                reason,
                            })
                        }
                        PodReadiness::Pending => {}
                    }
                }
                tokio::time::sleep(self.timeouts.poll).await;
            }
        };
        tokio::time::timeout(self.timeouts.ready, wait)
            .await
            .map_err(|_| RunnerError::NotReady {
                pod: name.to_string(),
                timeout: self.timeouts.ready,
            })?
    }
}

#[derive(Debug, PartialEq, Eq)]
enum PodReadiness {
    Ready,
    Pending,
    Terminated(String),
}

fn pod_readiness(pod: &Pod) -> PodReadiness {
    if pod.metadata.deletion_timestamp.is_some() {
        return PodReadiness::Terminated("pod is terminating".to_string());
    }
    let Some(status) = pod.status.as_ref() else {
        return PodReadiness::Pending;
    };
    match status.phase.as_deref() {
        Some("Failed") | Some("Succeeded") => {
            let reason = status
                .reason
                .clone()
                .or_else(|| status.message.clone())
                .unwrap_or_else(|| format!("pod phase {}", status.phase.as_deref().unwrap_or("")));
            return PodReadiness::Terminated(reason);
        }
        Some("Running") => {}
        _ => return PodReadiness::Pending,
    }
    let ready = status
        .conditions
        .as_ref()
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        });
    if ready {
        PodReadiness::Ready
    } else {
        PodReadiness::Pending
    }
}

#[async_trait]
impl RunnerRuntime for KubeRunnerRuntime {
    async fn ensure(&self, tf: &Terraform) -> Result<RunnerHandle, RunnerError> {
        let desired = build_runner_pod(tf, &self.settings, &self.proxy_env);
        let name = runner_pod_name(tf);
        let api = self.api(tf);
        let span = info_span!("runner.ensure", runner.pod = %name);

        async move {
            if let Some(existing) = api.get_opt(&name).await? {
                let same_template = pod_template_hash(&existing) == pod_template_hash(&desired);
                let terminated = matches!(pod_readiness(&existing), PodReadiness::Terminated(_));
                if same_template && !terminated {
                    debug!("Reusing runner pod with matching template hash");
                    return self.wait_ready(&api, &name).await;
                }
                info!(same_template, terminated, "Replacing runner pod");
                self.delete(&api, &name).await?;
                self.wait_until_gone(&api, &name).await?;
            }

            api.create(&PostParams::default(), &desired).await?;
            observability::metrics::increment_runner_pods_created();
            info!("Created runner pod");
            self.wait_ready(&api, &name).await
        }
        .instrument(span)
        .await
    }

    async fn lookup(&self, tf: &Terraform) -> Result<Option<RunnerHandle>, RunnerError> {
        let name = runner_pod_name(tf);
        let pod = self.api(tf).get_opt(&name).await?;
        Ok(pod
            .filter(|pod| pod_readiness(pod) == PodReadiness::Ready)
            .and_then(|pod| self.handle(&pod)))
    }

    async fn teardown(&self, tf: &Terraform) -> Result<(), RunnerError> {
        let name = runner_pod_name(tf);
        let api = self.api(tf);
        match tokio::time::timeout(self.timeouts.teardown, self.delete(&api, &name)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(runner.pod = %name, "Runner pod deletion timed out");
                Err(RunnerError::TeardownTimeout {
                    pod: name,
                    timeout: self.timeouts.teardown,
                })
            }
        }
    }
}
