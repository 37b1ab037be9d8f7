use agentbox_common::args::{ListenArgs, PlatformArgs, ResourceLimitArgs, TimeoutArgs};
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "agentbox")]
#[command(about = "Control plane for short-lived, isolated sandbox environments")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the orchestrator API server
    Server(ServerArgs),

    /// Check connectivity to the container platform
    Health(HealthArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct ServerArgs {
    #[clap(flatten)]
    pub listen: ListenArgs,

    #[clap(flatten)]
    pub platform: PlatformArgs,

    #[clap(flatten)]
    pub limits: ResourceLimitArgs,

    #[clap(flatten)]
    pub timeouts: TimeoutArgs,

    /// Path to the JSON file mapping bearer api keys to principals
    #[arg(long, env = "API_KEYS_PATH", required = true)]
    pub api_keys_path: String,

    /// Comma-separated allowlist of browser origins. Empty allows all.
    #[arg(long, env = "ALLOWED_ORIGINS")]
    pub allowed_origins: Option<String>,
}

#[derive(Parser, Debug, Clone)]
pub struct HealthArgs {
    #[clap(flatten)]
    pub platform: PlatformArgs,
}
