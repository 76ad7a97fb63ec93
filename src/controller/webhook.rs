//! # Webhook Gate
//!
//! Consults the module's policy webhooks between plan and approval and turns
//! their answers into allow or deny.
//!
//! A webhook that cannot be reached, or does not answer within the timeout,
//! denies with `retry: true`. An unreachable policy never allows a plan.

use crate::controller::template::{evaluate, render};
use crate::crd::{PayloadType, Terraform, Webhook, WebhookStage};
use crate::observability;
use async_trait::async_trait;
use kube::ResourceExt;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info_span, warn, Instrument};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Allow,
    Deny {
        reason: String,
        /// The webhook could not be consulted; the denial is not a verdict
        retry: bool,
    },
}

/// Plan summary sent to webhooks
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanPayload {
    pub plan_id: String,
    pub is_destroy: bool,
    pub is_drift_detection_only: bool,
    pub revision: String,
    pub diff: String,
    pub json: Option<Value>,
}

#[async_trait]
pub trait WebhookGate: Send + Sync {
    /// Consult every enabled webhook of `stage`; the first denial wins
    async fn evaluate(&self, tf: &Terraform, stage: WebhookStage, plan: &PlanPayload) -> GateDecision;
}

/// Webhooks of `tf` that apply to `stage`
pub fn webhooks_for_stage(tf: &Terraform, stage: WebhookStage) -> impl Iterator<Item = &Webhook> {
    tf.spec
        .webhooks
        .iter()
        .filter(move |webhook| webhook.stage == stage && webhook.is_enabled())
}

/// Request body for a webhook
pub fn webhook_body(tf: &Terraform, webhook: &Webhook, plan: &PlanPayload) -> Value {
    match webhook.payload_type {
        PayloadType::SpecAndPlan => serde_json::json!({
            "name": tf.name_any(),
            "namespace": tf.namespace(),
            "spec": tf.spec,
            "plan": plan,
        }),
        PayloadType::PlanOnly => serde_json::json!(plan),
    }
}

/// Verdict of a 2xx response
pub fn judge_response(webhook: &Webhook, response: &Value) -> GateDecision {
    let Some(expression) = webhook.test_expression.as_deref() else {
        return GateDecision::Allow;
    };
    let passed = matches!(evaluate(expression, response), Ok(Some(Value::Bool(true))));
    if passed {
        return GateDecision::Allow;
    }
    let reason = webhook
        .error_message_template
        .as_deref()
        .and_then(|template| render(template, response).ok())
        .filter(|reason| !reason.trim().is_empty())
        .unwrap_or_else(|| format!("webhook {} rejected the plan", webhook.url));
    GateDecision::Deny {
        reason,
        retry: false,
    }
}

#[derive(Clone)]
pub struct HttpWebhookGate {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpWebhookGate {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }

    async fn call(&self, tf: &Terraform, webhook: &Webhook, plan: &PlanPayload) -> GateDecision {
        let body = webhook_body(tf, webhook, plan);
        let send = self.client.post(&webhook.url).json(&body).send();
        let response = match tokio::time::timeout(self.timeout, send).await {
            Err(_) => {
                return GateDecision::Deny {
                    reason: format!("webhook {} timed out after {:?}", webhook.url, self.timeout),
                    retry: true,
                }
            }
            Ok(Err(e)) => {
                return GateDecision::Deny {
                    reason: format!("webhook {} unreachable: {e}", webhook.url),
                    retry: true,
                }
            }
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        let text = match tokio::time::timeout(self.timeout, response.text()).await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                return GateDecision::Deny {
                    reason: format!("webhook {} response unreadable: {e}", webhook.url),
                    retry: true,
                }
            }
            Err(_) => {
                return GateDecision::Deny {
                    reason: format!("webhook {} timed out after {:?}", webhook.url, self.timeout),
                    retry: true,
                }
            }
        };
        let parsed: Value = serde_json::from_str(&text).unwrap_or(Value::Null);

        if !status.is_success() {
            let reason = webhook
                .error_message_template
                .as_deref()
                .and_then(|template| render(template, &parsed).ok())
                .filter(|reason| !reason.trim().is_empty())
                .unwrap_or_else(|| format!("webhook {} answered {status}", webhook.url));
            // A failing policy server is an outage, a 4xx is an answer
            return GateDecision::Deny {
                reason,
                retry: status.is_server_error(),
            };
        }
        judge_response(webhook, &parsed)
    }
}

#[async_trait]
impl WebhookGate for HttpWebhookGate {
    async fn evaluate(&self, tf: &Terraform, stage: WebhookStage, plan: &PlanPayload) -> GateDecision {
        for webhook in webhooks_for_stage(tf, stage) {
            let span = info_span!("webhook.call", webhook.url = %webhook.url, stage = stage.as_str());
            let decision = self.call(tf, webhook, plan).instrument(span).await;
            match decision {
                GateDecision::Allow => debug!(webhook.url = %webhook.url, "Webhook allowed the plan"),
                GateDecision::Deny { ref reason, retry } => {
                    observability::metrics::increment_webhook_denials(stage.as_str());
                    warn!(webhook.url = %webhook.url, retry, "Webhook denied the plan: {}", reason);
                    return decision;
                }
            }
        }
        GateDecision::Allow
    }
}
