//! # Reconcile Command
//!
//! Requests an immediate reconcile by touching the reconcile-request annotation.

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde_json::json;
use tf_controller::constants::RECONCILE_REQUEST_ANNOTATION;
use tf_controller::crd::Terraform;

/// Merge patch that sets the reconcile-request annotation to now
pub fn request_patch() -> serde_json::Value {
    json!({
        "metadata": {
            "annotations": {
                RECONCILE_REQUEST_ANNOTATION: Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
            }
        }
    })
}

pub async fn reconcile_command(client: Client, ns: &str, name: &str) -> Result<()> {
    let api: Api<Terraform> = Api::namespaced(client, ns);
    let resource = api
        .get(name)
        .await
        .with_context(|| format!("Failed to get Terraform '{ns}/{name}'"))?;

    println!("🔄 Requesting reconciliation of Terraform '{ns}/{name}'...");
    if resource.spec.suspend {
        println!("   ⚠️  Warning: Resource is suspended. Reconciliation will be skipped.");
        println!("   Use 'tfctl resume {name}' to resume reconciliation.");
    }

    api.patch(name, &PatchParams::default(), &Patch::Merge(request_patch()))
        .await
        .with_context(|| format!("Failed to request reconciliation of Terraform '{ns}/{name}'"))?;

    println!("✅ Reconciliation requested");
    Ok(())
}
