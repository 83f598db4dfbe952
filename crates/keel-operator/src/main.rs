//! keel operator - baremetal Kubernetes cluster lifecycle management

use clap::Parser;
use kube::Client;
use tracing::info;

use keel_common::telemetry::init_logging;
use keel_operator::config::{Cli, Commands, OperatorConfig};
use keel_operator::controller_runner::{
    build_context, build_controllers, crd_manifests, ensure_crds_installed,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        println!("{}", crd_manifests()?);
        return Ok(());
    }

    init_logging(cli.config.log_format)?;

    match cli.command {
        Some(Commands::Controller) | None => run_controller(cli.config).await,
    }
}

/// Run the controllers until a shutdown signal arrives
async fn run_controller(config: OperatorConfig) -> anyhow::Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "starting keel controller");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create kube client: {e}"))?;

    ensure_crds_installed(&client).await?;

    let ctx = build_context(client.clone(), &config)?;
    let controllers = build_controllers(client, ctx);
    futures::future::join_all(controllers).await;

    info!("controllers stopped");
    Ok(())
}
