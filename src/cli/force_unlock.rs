//! # Force-Unlock Command
//!
//! Writes a lock ID into `backendConfig.state.forceUnlock`, touches the
//! reconcile-request annotation and replaces the object with the resource
//! version it was read at. Conflicting writers are retried from a fresh read.

use anyhow::{Context, Result};
use chrono::Utc;
use kube::api::{Api, PostParams};
use kube::Client;
use std::io;
use tf_controller::controller::lock::{apply_force_unlock, ForceUnlockOutcome};
use tf_controller::crd::Terraform;

const CONFLICT_RETRIES: u32 = 5;

pub async fn force_unlock_command(client: Client, ns: &str, name: &str, lock_id: &str) -> Result<()> {
    if lock_id.trim().is_empty() {
        anyhow::bail!("--lock-id must not be empty");
    }
    let api: Api<Terraform> = Api::namespaced(client, ns);

    for attempt in 1..=CONFLICT_RETRIES {
        let mut resource = api
            .get(name)
            .await
            .with_context(|| format!("Failed to get Terraform '{ns}/{name}'"))?;

        let outcome = apply_force_unlock(&mut resource.spec, lock_id, ns, name, &mut io::stdout())?;
        resource.request_reconcile(Utc::now());

        match api.replace(name, &PostParams::default(), &resource).await {
            Ok(_) => {
                match outcome {
                    ForceUnlockOutcome::Setting => {
                        println!("✅ Force-unlock requested; the controller will release lock {lock_id}");
                    }
                    ForceUnlockOutcome::AlreadyAuto => {
                        println!("ℹ️  Stale locks are already cleared automatically; reconcile requested");
                    }
                }
                return Ok(());
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                eprintln!("   ⚠️  Terraform '{ns}/{name}' changed concurrently, retrying ({attempt}/{CONFLICT_RETRIES})");
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to update Terraform '{ns}/{name}'"));
            }
        }
    }
    anyhow::bail!("Gave up updating Terraform '{ns}/{name}' after {CONFLICT_RETRIES} conflicting attempts")
}
