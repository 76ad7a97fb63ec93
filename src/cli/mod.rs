//! # TFCTL CLI
//!
//! Command-line interface for the Terraform controller.
//!
//! ## Usage
//!
//! ```bash
//! # Request an immediate reconcile
//! tfctl reconcile hello-world
//!
//! # Pause and resume reconciliation
//! tfctl suspend hello-world
//! tfctl resume hello-world
//!
//! # Inspect and approve the pending plan
//! tfctl plan show hello-world
//! tfctl plan approve hello-world
//!
//! # Throw the pending plan away and plan again
//! tfctl replan hello-world
//!
//! # Release a stale backend lock
//! tfctl force-unlock hello-world --lock-id f2ab685b-f84d-ac0b-a125-378a22877e8d
//!
//! # List modules, or show one as YAML
//! tfctl get
//! tfctl get hello-world
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kube::Client;
use tf_controller::constants::DEFAULT_CLI_NAMESPACE;

mod force_unlock;
mod get;
mod plan;
mod reconcile;
mod suspend;

/// Terraform controller CLI
#[derive(Parser)]
#[command(name = "tfctl")]
#[command(
    about = "Terraform controller CLI",
    long_about = None,
    after_help = "\
Examples:
  tfctl get --namespace flux-system
  tfctl plan approve hello-world
  tfctl force-unlock hello-world --lock-id <LOCK_ID>
"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Kubernetes namespace
    #[arg(short, long, global = true, default_value = DEFAULT_CLI_NAMESPACE)]
    namespace: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the CLI version and build information
    Version,
    /// Request an immediate reconcile of a Terraform resource
    Reconcile {
        #[arg(value_name = "NAME")]
        name: String,
    },
    /// Suspend reconciliation of a Terraform resource
    Suspend {
        #[arg(value_name = "NAME")]
        name: String,
    },
    /// Resume reconciliation of a Terraform resource
    Resume {
        #[arg(value_name = "NAME")]
        name: String,
    },
    /// Show or approve the pending plan
    Plan {
        #[command(subcommand)]
        command: PlanCommands,
    },
    /// Approve the pending plan (same as `plan approve`)
    #[command(name = "approve-plan")]
    ApprovePlan {
        #[arg(value_name = "NAME")]
        name: String,
    },
    /// Show the pending plan (same as `plan show`)
    #[command(name = "show-plan")]
    ShowPlan {
        #[arg(value_name = "NAME")]
        name: String,
    },
    /// Discard the pending plan and plan again
    Replan {
        #[arg(value_name = "NAME")]
        name: String,
    },
    /// Release a lock held on the module's backing state
    #[command(name = "force-unlock")]
    ForceUnlock {
        #[arg(value_name = "NAME")]
        name: String,
        /// Lock ID reported by the backend
        #[arg(long)]
        lock_id: String,
    },
    /// List Terraform resources, or print one as YAML
    Get {
        #[arg(value_name = "NAME")]
        name: Option<String>,
    },
}

#[derive(Subcommand)]
enum PlanCommands {
    /// Print the pending plan
    Show {
        #[arg(value_name = "NAME")]
        name: String,
    },
    /// Approve the pending plan
    Approve {
        #[arg(value_name = "NAME")]
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Must run before the first TLS connection
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("rustls crypto provider was already installed");
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tfctl=info".into()),
        )
        .init();

    let cli = Cli::parse();
    if matches!(cli.command, Commands::Version) {
        print_version();
        return Ok(());
    }

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client. Ensure kubeconfig is configured.")?;
    let ns = cli.namespace;

    match cli.command {
        Commands::Version => Ok(()),
        Commands::Reconcile { name } => reconcile::reconcile_command(client, &ns, &name).await,
        Commands::Suspend { name } => suspend::suspend_command(client, &ns, &name).await,
        Commands::Resume { name } => suspend::resume_command(client, &ns, &name).await,
        Commands::Plan {
            command: PlanCommands::Show { name },
        }
        | Commands::ShowPlan { name } => plan::show_command(client, &ns, &name).await,
        Commands::Plan {
            command: PlanCommands::Approve { name },
        }
        | Commands::ApprovePlan { name } => plan::approve_command(client, &ns, &name).await,
        Commands::Replan { name } => plan::replan_command(client, &ns, &name).await,
        Commands::ForceUnlock { name, lock_id } => {
            force_unlock::force_unlock_command(client, &ns, &name, &lock_id).await
        }
        Commands::Get { name } => get::get_command(client, &ns, name.as_deref()).await,
    }
}

fn print_version() {
    println!("tfctl {}", env!("CARGO_PKG_VERSION"));
    println!(
        "Build: {} ({})",
        env!("BUILD_DATETIME"),
        env!("BUILD_GIT_HASH")
    );
}
