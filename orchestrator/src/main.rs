use anyhow::{Context, Result};
use clap::Parser;
use owo_colors::OwoColorize;

mod args;
mod attach;
mod auth;
mod error;
mod exec;
mod handlers;
mod platform;
mod provision;
mod reconcile;
mod registry;
mod selector;
mod server;
mod validate;

use args::{Cli, Commands, HealthArgs};
use platform::Platform;
use platform::kube::KubePlatform;
use server::run_server;

#[tokio::main]
async fn main() -> Result<()> {
    agentbox_common::init();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("LOG_LEVEL")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server(args) => {
            agentbox_common::metrics::maybe_spawn_metrics_server();
            run_server(args).await
        }
        Commands::Health(args) => run_health(args).await,
    }
}

/// Verify the orchestrator can reach the container platform and print a
/// capacity snapshot.
async fn run_health(args: HealthArgs) -> Result<()> {
    let platform = KubePlatform::connect(
        args.platform.kubeconfig_path.as_deref(),
        args.platform.cluster_dns_namespace,
    )
    .await
    .context("failed to connect to the container platform")?;
    platform.health_check().await.context("platform unhealthy")?;
    let version = platform.server_version().await?;
    let capacity = platform.cluster_capacity().await?;
    println!(
        "{}{}{}{}{}{}{}{}",
        "🟢 platform ok • version=".green(),
        version.green().dimmed(),
        " • nodes=".green(),
        capacity.nodes.to_string().green().dimmed(),
        " • cpu=".green(),
        capacity.cpu.green().dimmed(),
        " • memory=".green(),
        capacity.memory.green().dimmed(),
    );
    Ok(())
}
