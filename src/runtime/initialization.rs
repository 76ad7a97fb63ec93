//! # Initialization
//!
//! Controller initialization: rustls setup, tracing, metrics, probe server,
//! Kubernetes client and the collaborators behind the reconciler.

use crate::config::ControllerConfig;
use crate::controller::health::NetworkHealthChecker;
use crate::controller::reconciler::{Collaborators, Reconciler};
use crate::controller::runner::env::proxy_env_from_process;
use crate::controller::runner::template::RunnerSettings;
use crate::controller::runner::{KubeRunnerRuntime, RunnerTimeouts};
use crate::controller::secrets::KubeSecretsClient;
use crate::controller::server::{start_server, ServerState};
use crate::controller::session::HttpSessionFactory;
use crate::controller::source::FluxSourceResolver;
use crate::controller::store::KubeStatusStore;
use crate::controller::webhook::HttpWebhookGate;
use crate::crd::Terraform;
use crate::observability;
use anyhow::{Context, Result};
use kube::api::{Api, ListParams};
use kube::Client;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Everything the watch loop needs
pub struct InitializationResult {
    pub client: Client,
    /// `Terraform` resources across all namespaces
    pub modules: Api<Terraform>,
    pub reconciler: Arc<Reconciler>,
    pub server_state: Arc<ServerState>,
    pub config: ControllerConfig,
}

impl std::fmt::Debug for InitializationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitializationResult")
            .field("server_ready", &self.server_state.ready())
            .field("instance_id", &self.config.instance_id)
            .finish_non_exhaustive()
    }
}

/// Initialize the controller runtime
///
/// Installs the rustls provider, sets up tracing and metrics, starts the probe
/// server and builds the Kubernetes-backed collaborators.
pub async fn initialize() -> Result<InitializationResult> {
    // Must run before any TLS connection is opened
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("rustls crypto provider was already installed");
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tf_controller=info".into()),
        )
        .init();

    info!("Starting Terraform controller");
    info!(
        "Build info: timestamp={}, datetime={}, git_hash={}",
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_DATETIME"),
        env!("BUILD_GIT_HASH")
    );

    let config = ControllerConfig::from_env();
    info!(
        instance_id = %config.instance_id,
        max_concurrent_reconciles = config.max_concurrent_reconciles,
        lock_liveness_secs = config.lock_liveness_secs,
        "Loaded controller configuration"
    );

    observability::metrics::register_metrics()?;

    let server_state = Arc::new(ServerState::new());
    let server_port = config.metrics_port;
    let server_state_clone = Arc::clone(&server_state);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(server_port, server_state_clone).await {
            error!("HTTP server error: {}", e);
        }
    });
    wait_for_server_ready(&server_state, &server_handle, &config).await?;

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    let modules: Api<Terraform> = Api::all(client.clone());

    let reconciler = Arc::new(Reconciler::new(
        collaborators(client.clone(), &config),
        config.clone(),
    ));

    summarize_existing_resources(&modules).await;
    info!("Controller initialized, starting watch loop...");

    Ok(InitializationResult {
        client,
        modules,
        reconciler,
        server_state,
        config,
    })
}

/// Kubernetes and HTTP implementations of every collaborator
#[must_use]
pub fn collaborators(client: Client, config: &ControllerConfig) -> Collaborators {
    let proxy = proxy_env_from_process();
    if !proxy.is_empty() {
        info!(count = proxy.len(), "Propagating proxy variables to runner pods");
    }
    let runners = KubeRunnerRuntime::new(
        client.clone(),
        RunnerSettings {
            image: config.runner_image.clone(),
            port: config.runner_port,
            instance_id: config.instance_id.clone(),
            grace_period_secs: crate::constants::DEFAULT_RUNNER_GRACE_PERIOD_SECS,
        },
        RunnerTimeouts {
            ready: config.runner_ready_timeout(),
            poll: config.runner_poll_interval(),
            teardown: config.runner_teardown_timeout(),
        },
        proxy,
    );
    Collaborators {
        store: Arc::new(KubeStatusStore::new(client.clone())),
        runners: Arc::new(runners),
        sessions: Arc::new(HttpSessionFactory::new(
            config.probe_timeout(),
            config.command_timeout(),
        )),
        sources: Arc::new(FluxSourceResolver::new(client.clone())),
        secrets: Arc::new(KubeSecretsClient::new(client)),
        webhooks: Arc::new(HttpWebhookGate::new(config.webhook_timeout())),
        health: Arc::new(NetworkHealthChecker::new(config.health_check_timeout())),
    }
}

async fn wait_for_server_ready(
    server_state: &ServerState,
    server_handle: &tokio::task::JoinHandle<()>,
    config: &ControllerConfig,
) -> Result<()> {
    let startup_timeout = Duration::from_secs(config.server_startup_timeout_secs);
    let poll_interval = Duration::from_millis(config.server_poll_interval_ms);
    let start_time = Instant::now();

    loop {
        if server_handle.is_finished() {
            return Err(anyhow::anyhow!("HTTP server failed to start"));
        }
        if server_state.ready() {
            info!("HTTP server is ready and accepting connections");
            return Ok(());
        }
        if start_time.elapsed() > startup_timeout {
            return Err(anyhow::anyhow!(
                "HTTP server failed to become ready within {} seconds",
                startup_timeout.as_secs()
            ));
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// Log what the controller is about to manage
///
/// The watch delivers every existing object on start, so nothing is
/// reconciled here; a failing list only means the CRD is missing.
async fn summarize_existing_resources(modules: &Api<Terraform>) {
    match modules.list(&ListParams::default()).await {
        Ok(list) => {
            let mut by_namespace: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for item in &list.items {
                by_namespace
                    .entry(item.metadata.namespace.clone().unwrap_or_default())
                    .or_default()
                    .push(item.metadata.name.clone().unwrap_or_default());
            }
            info!(
                "Found {} existing Terraform resources in {} namespaces",
                list.items.len(),
                by_namespace.len()
            );
            for (namespace, mut names) in by_namespace {
                names.sort();
                let shown = if names.len() <= 3 {
                    names.join(", ")
                } else {
                    format!("{}, ... ({} total)", names[..3].join(", "), names.len())
                };
                info!("  {}: {}", namespace, shown);
            }
        }
        Err(e) => {
            error!("CRD is not queryable; {:?}. Is the CRD installed?", e);
            error!("Installation: crdgen | kubectl apply -f -");
            warn!("Continuing despite CRD queryability check failure - the watch will retry");
        }
    }
}
