//! # Webhooks and Health Checks

use serde::{Deserialize, Serialize};

/// Phase at which a webhook is consulted
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, schemars::JsonSchema)]
pub enum WebhookStage {
    /// After a plan with changes, before it becomes eligible for approval
    #[serde(rename = "post-planning")]
    PostPlanning,
}

impl WebhookStage {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookStage::PostPlanning => "post-planning",
        }
    }
}

/// What the webhook receives
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, schemars::JsonSchema)]
pub enum PayloadType {
    #[default]
    SpecAndPlan,
    PlanOnly,
}

/// Policy callback
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Webhook {
    pub stage: WebhookStage,
    /// Skipped when false. Default: true
    #[serde(default)]
    pub enabled: Option<bool>,
    pub url: String,
    #[serde(default)]
    pub payload_type: PayloadType,
    /// Deny reason rendered against the response, e.g. `${{ .message }}`
    #[serde(default)]
    pub error_message_template: Option<String>,
    /// Expression that must resolve to `true` in the response, e.g. `${{ .passed }}`
    #[serde(default)]
    pub test_expression: Option<String>,
}

impl Webhook {
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckType {
    Tcp,
    Http,
}

/// Post-apply check
///
/// `url` and `address` may reference outputs, e.g. `https://${{ .endpoint }}/health`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    pub name: String,
    #[serde(rename = "type")]
    pub check_type: HealthCheckType,
    #[serde(default)]
    pub url: Option<String>,
    /// `host:port` for tcp checks
    #[serde(default)]
    pub address: Option<String>,
    /// Duration string. Defaults to the controller's `HEALTH_CHECK_TIMEOUT_SECS`
    #[serde(default)]
    pub timeout: Option<String>,
}
