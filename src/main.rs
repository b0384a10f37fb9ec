//! Skylift Operator - hosted Kubernetes control planes in a host cluster

use clap::Parser;
use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use k8s_openapi::api::apps::v1::Deployment;
use skylift::controller::{error_policy, reconcile, Context};
use skylift::crd::{ControlPlane, EtcdCluster};

/// Skylift - CRD-driven operator running hosted control planes as workloads
#[derive(Parser, Debug)]
#[command(name = "skylift", version, about, long_about = None)]
struct Cli {
    /// Generate the ControlPlane CRD manifest and exit
    #[arg(long)]
    crd: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&ControlPlane::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    run_controller().await
}

/// Ensure the ControlPlane CRD is installed
///
/// The operator installs its own CRD on startup using server-side apply, so
/// the installed CRD version always matches the operator version. The
/// EtcdCluster CRD belongs to the etcd operator and is not installed here.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(skylift::controller::FIELD_MANAGER).force();

    tracing::info!("Installing ControlPlane CRD...");
    crds.patch(
        "controlplanes.skylift.dev",
        &params,
        &Patch::Apply(&ControlPlane::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install ControlPlane CRD: {}", e))?;

    tracing::info!("ControlPlane CRD installed/updated");
    Ok(())
}

/// Run the ControlPlane controller
async fn run_controller() -> anyhow::Result<()> {
    let client = Client::try_default().await?;

    ensure_crds_installed(&client).await?;

    let ctx = Arc::new(Context::builder(client.clone()).build());

    let control_planes: Api<ControlPlane> = Api::all(client.clone());
    let etcd_clusters: Api<EtcdCluster> = Api::all(client.clone());
    let deployments: Api<Deployment> = Api::all(client);

    tracing::info!("Starting Skylift controller...");

    // Owned EtcdClusters and Deployments retrigger reconciliation, which is
    // what makes the await_change gates make progress without a timer
    Controller::new(control_planes, WatcherConfig::default())
        .owns(etcd_clusters, WatcherConfig::default())
        .owns(deployments, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "ControlPlane reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "ControlPlane reconciliation error");
                }
            }
        })
        .await;

    tracing::info!("Skylift controller terminated");
    Ok(())
}
