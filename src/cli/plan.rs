//! # Plan Commands
//!
//! Show, approve and discard the pending plan of a Terraform resource.

use anyhow::{Context, Result};
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde_json::json;
use tf_controller::controller::secrets::{
    readable_plan_name, KubeSecretsClient, SecretsClient, READABLE_PLAN_KEY,
};
use tf_controller::crd::{DataSourceKind, ReadablePlanFormat, Terraform};

async fn pending_plan(api: &Api<Terraform>, ns: &str, name: &str) -> Result<(Terraform, Option<String>)> {
    let resource = api
        .get(name)
        .await
        .with_context(|| format!("Failed to get Terraform '{ns}/{name}'"))?;
    let pending = resource
        .status
        .as_ref()
        .and_then(|status| status.pending_plan())
        .map(str::to_string);
    Ok((resource, pending))
}

pub async fn show_command(client: Client, ns: &str, name: &str) -> Result<()> {
    let api: Api<Terraform> = Api::namespaced(client.clone(), ns);
    let (resource, pending) = pending_plan(&api, ns, name).await?;
    let Some(plan_id) = pending else {
        println!("ℹ️  Terraform '{ns}/{name}' has no pending plan");
        return Ok(());
    };

    println!("📋 Pending plan: {plan_id}");
    if resource.spec.store_readable_plan == ReadablePlanFormat::None {
        println!("   Set spec.storeReadablePlan to 'human' or 'json' to keep a readable copy.");
        return Ok(());
    }

    let config_map = readable_plan_name(&resource);
    let data = KubeSecretsClient::new(client)
        .read(ns, DataSourceKind::ConfigMap, &config_map)
        .await
        .with_context(|| format!("Failed to read ConfigMap '{ns}/{config_map}'"))?;
    match data.as_ref().and_then(|d| d.get(READABLE_PLAN_KEY)) {
        Some(content) => println!("\n{content}"),
        None => println!("   Readable plan '{config_map}' is not available yet."),
    }
    Ok(())
}

pub async fn approve_command(client: Client, ns: &str, name: &str) -> Result<()> {
    let api: Api<Terraform> = Api::namespaced(client, ns);
    let (resource, pending) = pending_plan(&api, ns, name).await?;
    let plan_id = pending
        .ok_or_else(|| anyhow::anyhow!("Terraform '{ns}/{name}' has no pending plan to approve"))?;
    if resource.spec.approve_plan == plan_id {
        println!("ℹ️  Plan {plan_id} is already approved");
        return Ok(());
    }

    api.patch(
        name,
        &PatchParams::default(),
        &Patch::Merge(json!({ "spec": { "approvePlan": plan_id } })),
    )
    .await
    .with_context(|| format!("Failed to approve plan of Terraform '{ns}/{name}'"))?;
    println!("✅ Plan {plan_id} approved; the controller will apply it shortly");
    Ok(())
}

/// Clear the pending plan in status and request a fresh reconcile
pub async fn replan_command(client: Client, ns: &str, name: &str) -> Result<()> {
    let api: Api<Terraform> = Api::namespaced(client, ns);
    let (_, pending) = pending_plan(&api, ns, name).await?;

    if let Some(plan_id) = &pending {
        println!("🗑️  Discarding pending plan {plan_id}...");
        let status = json!({
            "status": {
                "plan": {
                    "pending": null,
                    "runnerPod": null,
                    "specFingerprint": null,
                    "isDestroyPlan": false,
                    "isDriftDetectionOnly": false
                },
                "lastPlanFingerprint": null
            }
        });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(status))
            .await
            .with_context(|| format!("Failed to clear pending plan of Terraform '{ns}/{name}'"))?;
    }

    api.patch(
        name,
        &PatchParams::default(),
        &Patch::Merge(super::reconcile::request_patch()),
    )
    .await
    .with_context(|| format!("Failed to request reconciliation of Terraform '{ns}/{name}'"))?;
    println!("✅ Replan requested");
    Ok(())
}
