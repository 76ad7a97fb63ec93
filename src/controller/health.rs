//! # Health Checks
//!
//! TCP and HTTP probes run after a successful apply. Addresses and URLs may
//! reference module outputs with `${{ .output_name }}`.

use crate::controller::reconciler::validation::parse_kubernetes_duration;
use crate::controller::template::render;
use crate::crd::{HealthCheck, HealthCheckType};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// `Err(message)` names the failing check
    async fn check(&self, checks: &[HealthCheck], outputs: &Value) -> Result<(), String>;
}

/// Probes over the network with tokio and reqwest
#[derive(Clone)]
pub struct NetworkHealthChecker {
    client: reqwest::Client,
    default_timeout: Duration,
}

impl NetworkHealthChecker {
    #[must_use]
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            default_timeout,
        }
    }

    fn timeout_for(&self, check: &HealthCheck) -> Duration {
        check
            .timeout
            .as_deref()
            .and_then(|t| parse_kubernetes_duration(t).ok())
            .unwrap_or(self.default_timeout)
    }

    async fn run(&self, check: &HealthCheck, outputs: &Value) -> Result<(), String> {
        let timeout = self.timeout_for(check);
        match check.check_type {
            HealthCheckType::Tcp => {
                let address = check
                    .address
                    .as_deref()
                    .ok_or_else(|| format!("health check '{}' has no address", check.name))?;
                let address = render(address, outputs).map_err(|e| e.to_string())?;
                match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&address)).await {
                    Ok(Ok(_)) => Ok(()),
                    Ok(Err(e)) => Err(format!("health check '{}' failed: {e}", check.name)),
                    Err(_) => Err(format!(
                        "health check '{}' timed out after {timeout:?}",
                        check.name
                    )),
                }
            }
            HealthCheckType::Http => {
                let url = check
                    .url
                    .as_deref()
                    .ok_or_else(|| format!("health check '{}' has no url", check.name))?;
                let url = render(url, outputs).map_err(|e| e.to_string())?;
                match self.client.get(&url).timeout(timeout).send().await {
                    Ok(response) if response.status().is_success() => Ok(()),
                    Ok(response) => Err(format!(
                        "health check '{}' answered {}",
                        check.name,
                        response.status()
                    )),
                    Err(e) => Err(format!("health check '{}' failed: {e}", check.name)),
                }
            }
        }
    }
}

#[async_trait]
impl HealthChecker for NetworkHealthChecker {
    async fn check(&self, checks: &[HealthCheck], outputs: &Value) -> Result<(), String> {
        for check in checks {
            self.run(check, outputs).await?;
            debug!(check = %check.name, "health.check.passed");
        }
        Ok(())
    }
}
