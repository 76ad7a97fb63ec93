//! # Get Command
//!
//! Lists Terraform resources in a namespace, or prints one as YAML.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use kube::api::{Api, ListParams};
use kube::Client;
use tf_controller::crd::{Terraform, CONDITION_READY};

pub async fn get_command(client: Client, ns: &str, name: Option<&str>) -> Result<()> {
    let api: Api<Terraform> = Api::namespaced(client, ns);

    if let Some(name) = name {
        let resource = api
            .get(name)
            .await
            .with_context(|| format!("Failed to get Terraform '{ns}/{name}'"))?;
        let yaml = serde_yaml::to_string(&resource).context("Failed to render resource as YAML")?;
        print!("{yaml}");
        return Ok(());
    }

    let modules = api
        .list(&ListParams::default())
        .await
        .context("Failed to list Terraform resources")?;

    if modules.items.is_empty() {
        println!("No Terraform resources found in namespace '{ns}'.");
        return Ok(());
    }

    println!(
        "{:<30} {:<8} {:<18} {:<30} {:<8} MESSAGE",
        "NAME", "READY", "PHASE", "PENDING PLAN", "AGE"
    );
    let now = Utc::now();
    for module in &modules.items {
        println!("{}", table_row(module, now));
    }
    Ok(())
}

fn table_row(module: &Terraform, now: DateTime<Utc>) -> String {
    let name = module.metadata.name.as_deref().unwrap_or("<unknown>");
    let status = module.status.as_ref();
    let ready = status.and_then(|s| s.condition(CONDITION_READY));
    let ready_status = ready.map_or("Unknown", |c| c.status.as_str());
    let message = ready.and_then(|c| c.message.as_deref()).unwrap_or("");
    let phase = status
        .and_then(|s| s.phase)
        .map_or("-", |phase| phase.as_str());
    let pending = status.and_then(|s| s.pending_plan()).unwrap_or("-");
    let age = module
        .metadata
        .creation_timestamp
        .as_ref()
        .and_then(|t| serde_json::to_value(t).ok())
        .and_then(|v| v.as_str().and_then(|s| DateTime::parse_from_rfc3339(s).ok()))
        .map_or_else(|| "-".to_string(), |t| format_age(now - t.with_timezone(&Utc)));

    format!("{name:<30} {ready_status:<8} {phase:<18} {pending:<30} {age:<8} {message}")
}

/// Compact age the way kubectl prints it
fn format_age(age: chrono::Duration) -> String {
    let secs = age.num_seconds().max(0);
    match secs {
        s if s < 120 => format!("{s}s"),
        s if s < 7_200 => format!("{}m", s / 60),
        s if s < 172_800 => format!("{}h", s / 3_600),
        s => format!("{}d", s / 86_400),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_age() {
        assert_eq!(format_age(chrono::Duration::seconds(42)), "42s");
        assert_eq!(format_age(chrono::Duration::minutes(5)), "5m");
        assert_eq!(format_age(chrono::Duration::hours(3)), "3h");
        assert_eq!(format_age(chrono::Duration::days(4)), "4d");
        assert_eq!(format_age(chrono::Duration::seconds(-3)), "0s");
    }

    #[test]
    fn test_table_row_without_status() {
        let module: Terraform = serde_json::from_value(serde_json::json!({
            "apiVersion": "infra.contrib.fluxcd.io/v1alpha1",
            "kind": "Terraform",
            "metadata": { "name": "hello-world", "namespace": "flux-system" },
            "spec": {
                "path": "./",
                "sourceRef": { "kind": "GitRepository", "name": "infra" }
            }
        }))
        .expect("valid Terraform");
        let row = table_row(&module, Utc::now());
        assert!(row.starts_with("hello-world"));
        assert!(row.contains("Unknown"));
    }
}
