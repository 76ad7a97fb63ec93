//! # Execution Session
//!
//! Request/response channel to one runner pod instance.
//!
//! The runner serves JSON over HTTP at `{endpoint}/v1/{command}` and a
//! readiness probe at `{endpoint}/healthz`. A runner that cannot be reached,
//! or answers as if it were gone, yields [`SessionError::Unavailable`]; a
//! command that ran and failed yields [`SessionError::ExecutionFailed`].
//! The reconciler only treats the former as "pod disappeared, re-plan".

use crate::controller::runner::RunnerHandle;
use crate::crd::{BackendConfigSpec, CloudSpec, ResourceRef};
use crate::observability;
use async_trait::async_trait;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

/// Lock held on the backing state, as reported by the backend
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    pub id: String,
    #[serde(default)]
    pub who: Option<String>,
    #[serde(default)]
    pub operation: Option<String>,
    #[serde(default)]
    pub created: Option<String>,
}

#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("runner unavailable: {0}")]
    Unavailable(String),
    #[error("execution failed: {message}")]
    ExecutionFailed {
        message: String,
        lock_info: Option<LockInfo>,
    },
    #[error("runner command timed out after {0:?}")]
    Timeout(Duration),
}

/// Working directory preparation
#[derive(Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitRequest {
    pub source_url: String,
    pub revision: String,
    pub path: String,
    pub workspace: String,
    pub backend_config: Option<BackendConfigSpec>,
    /// Backend keys gathered from `backendConfigsFrom`
    pub backend_configs: BTreeMap<String, String>,
    /// Resolved input variables, including secret-sourced values
    pub variables: BTreeMap<String, serde_json::Value>,
    pub cloud: Option<CloudSpec>,
    pub lock_timeout: Option<String>,
}

impl fmt::Debug for InitRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitRequest")
            .field("source_url", &self.source_url)
            .field("revision", &self.revision)
            .field("path", &self.path)
            .field("workspace", &self.workspace)
            .field("backend_configs", &self.backend_configs.keys().collect::<Vec<_>>())
            .field("variables", &self.variables.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRequest {
    /// Identifier the runner stores the plan under
    pub plan_id: String,
    pub destroy: bool,
    pub drift_detection_only: bool,
    pub targets: Vec<String>,
    pub parallelism: i32,
    pub refresh: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlanResult {
    pub has_changes: bool,
    pub is_destroy: bool,
    pub plan_id: String,
    /// Human-readable rendering of the changes
    #[serde(default)]
    pub diff: String,
    /// Machine-readable rendering of the changes
    #[serde(default)]
    pub json: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyRequest {
    pub plan_id: String,
    pub parallelism: i32,
    pub refresh_before_apply: bool,
}

#[derive(Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutputValue {
    #[serde(default)]
    pub sensitive: bool,
    pub value: serde_json::Value,
}

impl fmt::Debug for OutputValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputValue")
            .field("sensitive", &self.sensitive)
            .field("value", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApplyResult {
    #[serde(default)]
    pub inventory: Vec<ResourceRef>,
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputValue>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DestroyRequest {
    pub inventory: Vec<ResourceRef>,
    pub targets: Vec<String>,
}

/// Commands issued to a live runner
#[async_trait]
pub trait ExecutionSession: Send + Sync {
    /// Runner instance this session is bound to
    fn runner(&self) -> &RunnerHandle;

    async fn init(&self, request: &InitRequest) -> Result<(), SessionError>;

    async fn plan(&self, request: &PlanRequest) -> Result<PlanResult, SessionError>;

    /// Apply a plan previously produced on this runner
    ///
    /// Implementations must not abandon an apply the runner already started.
    async fn apply(&self, request: &ApplyRequest) -> Result<ApplyResult, SessionError>;

    async fn destroy(&self, request: &DestroyRequest) -> Result<(), SessionError>;

    async fn output(&self) -> Result<BTreeMap<String, OutputValue>, SessionError>;

    /// Clear a lock on the backing state
    async fn force_unlock(&self, lock_id: &str) -> Result<(), SessionError>;
}

/// Opens sessions against runners, probing readiness first
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn connect(&self, runner: &RunnerHandle) -> Result<Box<dyn ExecutionSession>, SessionError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    lock_info: Option<LockInfo>,
}

#[derive(Debug, Clone)]
pub struct HttpSessionFactory {
    client: reqwest::Client,
    probe_timeout: Duration,
    command_timeout: Duration,
}

impl HttpSessionFactory {
    #[must_use]
    pub fn new(probe_timeout: Duration, command_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            probe_timeout,
            command_timeout,
        }
    }
}

#[async_trait]
impl SessionFactory for HttpSessionFactory {
    async fn connect(&self, runner: &RunnerHandle) -> Result<Box<dyn ExecutionSession>, SessionError> {
        let url = format!("{}/healthz", runner.endpoint);
        let probe = self.client.get(&url).timeout(self.probe_timeout).send().await;
        match probe {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                return Err(SessionError::Unavailable(format!(
                    "readiness probe of {} returned {}",
                    runner.pod_name,
                    response.status()
                )))
            }
            Err(e) => {
                return Err(SessionError::Unavailable(format!(
                    "readiness probe of {} failed: {e}",
                    runner.pod_name
                )))
            }
        }
        Ok(Box::new(HttpSession {
            client: self.client.clone(),
            runner: runner.clone(),
            command_timeout: self.command_timeout,
        }))
    }
}

#[derive(Debug)]
pub struct HttpSession {
    client: reqwest::Client,
    runner: RunnerHandle,
    command_timeout: Duration,
}

impl HttpSession {
    async fn call<Req, Resp>(&self, command: &str, request: &Req) -> Result<Resp, SessionError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        self.send(command, request, Some(self.command_timeout)).await
    }

    /// Issue `command`, waiting at most `limit` for the answer
    ///
    /// `None` waits until the runner answers or the connection drops.
    async fn send<Req, Resp>(
        &self,
        command: &str,
        request: &Req,
        limit: Option<Duration>,
    ) -> Result<Resp, SessionError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let request_id = uuid::Uuid::new_v4().to_string();
        let span = info_span!(
            "session.command",
            command,
            runner.pod = %self.runner.pod_name,
            request.id = %request_id
        );
        let start = Instant::now();
        let result = async {
            let url = format!("{}/v1/{}", self.runner.endpoint, command);
            let send = self
                .client
                .post(&url)
                .header("x-request-id", &request_id)
                .json(request)
                .send();
            let sent = match limit {
                Some(limit) => tokio::time::timeout(limit, send)
                    .await
                    .map_err(|_| SessionError::Timeout(limit))?,
                None => send.await,
            };
            let response = match sent {
                Err(e) if e.is_timeout() => {
                    return Err(SessionError::Timeout(limit.unwrap_or_default()))
                }
                Err(e) => return Err(SessionError::Unavailable(e.to_string())),
                Ok(response) => response,
            };

            let status = response.status();
            if matches!(status.as_u16(), 404 | 502 | 503) {
                return Err(SessionError::Unavailable(format!(
                    "runner {} answered {status}",
                    self.runner.pod_name
                )));
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                let parsed: Option<ErrorBody> = serde_json::from_str(&body).ok();
                let (message, lock_info) = match parsed {
                    Some(body) if !body.error.is_empty() => (body.error, body.lock_info),
                    Some(body) => (format!("runner answered {status}"), body.lock_info),
                    None if body.is_empty() => (format!("runner answered {status}"), None),
                    None => (body, None),
                };
                return Err(SessionError::ExecutionFailed { message, lock_info });
            }

            let body = response
                .text()
                .await
                .map_err(|e| SessionError::Unavailable(e.to_string()))?;
            let body = if body.trim().is_empty() { "null" } else { body.as_str() };
            serde_json::from_str::<Resp>(body)
                .map_err(|e| SessionError::Unavailable(format!("malformed runner response: {e}")))
        }
        .instrument(span)
        .await;

        let outcome = match &result {
            Ok(_) => "success",
            Err(SessionError::Unavailable(_)) => "unavailable",
            Err(SessionError::ExecutionFailed { .. }) => "failed",
            Err(SessionError::Timeout(_)) => "timeout",
        };
        observability::metrics::observe_session_command(
            command,
            outcome,
            start.elapsed().as_secs_f64(),
        );
        debug!(command, outcome, "session.command.complete");
        result
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ForceUnlockRequest<'a> {
    lock_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct OutputResponse {
    #[serde(default)]
    outputs: BTreeMap<String, OutputValue>,
}

#[async_trait]
impl ExecutionSession for HttpSession {
    fn runner(&self) -> &RunnerHandle {
        &self.runner
    }

    async fn init(&self, request: &InitRequest) -> Result<(), SessionError> {
        self.call::<_, IgnoredAny>("init", request).await.map(|_| ())
    }

    async fn plan(&self, request: &PlanRequest) -> Result<PlanResult, SessionError> {
        self.call("plan", request).await
    }

    /// Not bounded by the command timeout: an apply runs to completion
    async fn apply(&self, request: &ApplyRequest) -> Result<ApplyResult, SessionError> {
        self.send("apply", request, None).await
    }

    async fn destroy(&self, request: &DestroyRequest) -> Result<(), SessionError> {
        self.call::<_, IgnoredAny>("destroy", request).await.map(|_| ())
    }

    async fn output(&self) -> Result<BTreeMap<String, OutputValue>, SessionError> {
        self.call::<_, OutputResponse>("output", &serde_json::json!({}))
            .await
            .map(|response| response.outputs)
    }

    async fn force_unlock(&self, lock_id: &str) -> Result<(), SessionError> {
        self.call::<_, IgnoredAny>("force-unlock", &ForceUnlockRequest { lock_id })
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_request_debug_hides_values() {
        let request = InitRequest {
            variables: BTreeMap::from([(
                "db_password".to_string(),
                serde_json::json!("hunter2"),
            )]),
            ..Default::default()
        };
        let rendered = format!("{request:?}");
        assert!(rendered.contains("db_password"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_output_value_debug_hides_value() {
        let output = OutputValue {
            sensitive: true,
            value: serde_json::json!("s3cr3t"),
        };
        assert!(!format!("{output:?}").contains("s3cr3t"));
    }
}
