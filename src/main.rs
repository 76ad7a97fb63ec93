//! # Terraform Controller
//!
//! A Kubernetes controller that reconciles `Terraform` resources: each one
//! names a Terraform module inside a Flux source artifact, and the controller
//! plans, applies and destroys it through a short-lived runner pod.
//!
//! ## Overview
//!
//! 1. **Watching modules** - `Terraform` resources across all namespaces
//! 2. **Resolving sources** - GitRepository, Bucket and OCIRepository artifacts
//! 3. **Planning** - on first run, spec or source change, drift checks and intervals
//! 4. **Gating** - manual or automatic approval, plus policy webhooks
//! 5. **Applying** - on the same runner pod that produced the plan
//! 6. **Finalizing** - optional destroy on deletion before the finalizer is released
//!
//! ## Usage
//!
//! Generate the CRD with `crdgen`, install it, then run this binary in-cluster.
//! Configuration comes from environment variables (see `ControllerConfig`).

use anyhow::Result;
use tf_controller::runtime::{initialization, watch_loop};

#[tokio::main]
async fn main() -> Result<()> {
    let init = initialization::initialize().await?;
    watch_loop::run_watch_loop(init.modules, init.reconciler, init.server_state, init.config)
        .await
}
