//! # Spec Validation
//!
//! Rejects specs the reconciler cannot act on. Failures surface as
//! `Invalid` and wait for a spec change.

use super::duration::parse_kubernetes_duration;
use crate::crd::{HealthCheckType, Terraform};
use anyhow::Result;

/// Validate the parts of a Terraform spec the reconciler depends on
pub fn validate_terraform(tf: &Terraform) -> Result<()> {
    let spec = &tf.spec;

    if spec.source_ref.name.trim().is_empty() {
        return Err(anyhow::anyhow!("sourceRef.name cannot be empty"));
    }

    parse_kubernetes_duration(&spec.interval)
        .map_err(|e| anyhow::anyhow!("interval: {e}"))?;
    parse_kubernetes_duration(spec.retry_interval_or_default())
        .map_err(|e| anyhow::anyhow!("retryInterval: {e}"))?;
    if let Some(drift) = &spec.drift_detection_interval {
        parse_kubernetes_duration(drift)
            .map_err(|e| anyhow::anyhow!("driftDetectionInterval: {e}"))?;
    }

    for variable in &spec.vars {
        if variable.name.trim().is_empty() {
            return Err(anyhow::anyhow!("vars: variable name cannot be empty"));
        }
        if let Some(source) = &variable.value_from {
            if source.secret_key_ref.is_some() == source.config_map_key_ref.is_some() {
                return Err(anyhow::anyhow!(
                    "vars[{}].valueFrom must set exactly one of secretKeyRef or configMapKeyRef",
                    variable.name
                ));
            }
        }
    }

    if let Some(outputs) = &spec.write_outputs_to_secret {
        if outputs.name.trim().is_empty() {
            return Err(anyhow::anyhow!("writeOutputsToSecret.name cannot be empty"));
        }
        for entry in &outputs.outputs {
            let valid = match entry.split_once(':') {
                Some((name, alias)) => !name.is_empty() && !alias.is_empty() && !alias.contains(':'),
                None => !entry.is_empty(),
            };
            if !valid {
                return Err(anyhow::anyhow!(
                    "writeOutputsToSecret.outputs entry '{entry}' must be 'name' or 'name:alias'"
                ));
            }
        }
    }

    for webhook in &spec.webhooks {
        let url = webhook.url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(anyhow::anyhow!(
                "webhooks: url '{}' must be an http(s) URL",
                webhook.url
            ));
        }
    }

    for check in &spec.health_checks {
        let target = match check.check_type {
            HealthCheckType::Tcp => check.address.as_deref(),
            HealthCheckType::Http => check.url.as_deref(),
        };
        if target.is_none_or(|t| t.trim().is_empty()) {
            return Err(anyhow::anyhow!(
                "healthChecks[{}]: {} check requires {}",
                check.name,
                match check.check_type {
                    HealthCheckType::Tcp => "tcp",
                    HealthCheckType::Http => "http",
                },
                match check.check_type {
                    HealthCheckType::Tcp => "address",
                    HealthCheckType::Http => "url",
                }
            ));
        }
        if let Some(timeout) = &check.timeout {
            parse_kubernetes_duration(timeout)
                .map_err(|e| anyhow::anyhow!("healthChecks[{}].timeout: {e}", check.name))?;
        }
    }

    Ok(())
}
