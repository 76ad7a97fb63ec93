//! # Suspend/Resume Commands

use anyhow::{Context, Result};
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde_json::json;
use tf_controller::crd::Terraform;

async fn set_suspend(client: Client, ns: &str, name: &str, suspend: bool) -> Result<bool> {
    let api: Api<Terraform> = Api::namespaced(client, ns);
    let resource = api
        .get(name)
        .await
        .with_context(|| format!("Failed to get Terraform '{ns}/{name}'"))?;
    if resource.spec.suspend == suspend {
        return Ok(false);
    }

    let mut patch = json!({ "spec": { "suspend": suspend } });
    if !suspend {
        // Resume acts at once instead of waiting for the next event
        if let (Some(target), serde_json::Value::Object(request)) =
            (patch.as_object_mut(), super::reconcile::request_patch())
        {
            target.extend(request);
        }
    }
    api.patch(name, &PatchParams::default(), &Patch::Merge(patch))
        .await
        .with_context(|| format!("Failed to update Terraform '{ns}/{name}'"))?;
    Ok(true)
}

pub async fn suspend_command(client: Client, ns: &str, name: &str) -> Result<()> {
    println!("⏸️  Suspending reconciliation of Terraform '{ns}/{name}'...");
    if !set_suspend(client, ns, name, true).await? {
        println!("   ℹ️  Resource is already suspended");
        return Ok(());
    }
    println!("✅ Reconciliation suspended");
    println!("\nTo resume reconciliation, run:");
    println!("   tfctl resume {name} --namespace {ns}");
    Ok(())
}

pub async fn resume_command(client: Client, ns: &str, name: &str) -> Result<()> {
    println!("▶️  Resuming reconciliation of Terraform '{ns}/{name}'...");
    if !set_suspend(client, ns, name, false).await? {
        println!("   ℹ️  Resource is already active (not suspended)");
        return Ok(());
    }
    println!("✅ Reconciliation resumed");
    Ok(())
}
