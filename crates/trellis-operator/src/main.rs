//! Trellis Operator - provisions downstream Kubernetes clusters on machine pools

mod config;
mod controller_runner;

use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::future::join_all;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use tokio_util::sync::CancellationToken;

use trellis_common::crd::all_crds;
use trellis_common::store::{KubeStore, ObjectStore};
use trellis_common::telemetry::{init_telemetry, TelemetryConfig};
use trellis_common::FIELD_MANAGER;
use trellis_provisioning::configserver::{self, handshake, ConfigServerState};
use trellis_provisioning::Context;

use config::ControllerArgs;

/// Trellis - CRD-driven provisioning of RKE2/K3s clusters
#[derive(Parser, Debug)]
#[command(name = "trellis-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(flatten)]
    controller: ControllerArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    ///
    /// Watches provisioning Clusters, expands them into control planes,
    /// node deployments and machines, distributes node plans, and serves
    /// node agents their plan credentials.
    Controller,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        println!("{}", crd_manifests()?);
        return Ok(());
    }

    let args = match cli.command {
        Some(Commands::Controller) | None => cli.controller,
    };

    init_telemetry(TelemetryConfig {
        service_name: "trellis-operator".to_string(),
        json: !args.log_plain,
    })
    .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    run_controller(args).await
}

/// Every CRD as one multi-document YAML stream
fn crd_manifests() -> anyhow::Result<String> {
    let docs = all_crds()
        .iter()
        .map(serde_yaml::to_string)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
    Ok(docs.join("---\n"))
}

/// Ensure all Trellis CRDs are installed
///
/// The operator installs its own CRDs on startup using server-side apply.
/// This ensures the CRD versions always match the operator version.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in all_crds() {
        let name = crd.name_any();
        tracing::info!(crd = %name, "Installing CRD");
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to install {} CRD: {}", name, e))?;
    }

    tracing::info!("All Trellis CRDs installed/updated");
    Ok(())
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    tracing::info!("Trellis controller starting...");

    let settings = args.settings()?;

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    let store: Arc<dyn ObjectStore> = Arc::new(KubeStore::new(client.clone()));
    let record_ttl = settings.handshake_record_ttl;
    let ctx = Arc::new(Context::new(store.clone(), settings));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown signal received");
            }
            cancel.cancel();
        });
    }

    let server_state = ConfigServerState::new(ctx.clone(), cancel.clone());
    let server_addr = args.config_server_addr;
    let server = tokio::spawn(configserver::serve(
        server_addr,
        server_state,
        cancel.clone(),
    ));
    let sweeper = tokio::spawn(handshake::run_sweeper(
        store,
        record_ttl,
        args.sweep_interval(),
        cancel.clone(),
    ));

    tracing::info!(addr = %server_addr, "Config server listening");
    tracing::info!("Starting controllers:");
    let controllers = controller_runner::build_provisioning_controllers(client, ctx);
    join_all(controllers).await;

    // Controllers stop on the same signal; make sure the server follows
    cancel.cancel();
    let served = server
        .await
        .map_err(|e| anyhow::anyhow!("Config server task failed: {}", e))?;
    if let Err(e) = sweeper.await {
        tracing::warn!(error = %e, "Handshake sweeper task failed");
    }
    served.map_err(|e| anyhow::anyhow!("Config server error: {}", e))?;

    tracing::info!("Trellis controller stopped");
    Ok(())
}
