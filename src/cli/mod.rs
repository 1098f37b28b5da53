//! CLI commands module.

mod agents;
mod gateway_cmd;
mod helpers;
mod sandbox_cmd;
mod serve;
mod sync_cmd;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub use agents::{cmd_agents, AgentsAction};
pub use gateway_cmd::{cmd_gateway, GatewayAction};
pub use helpers::App;
pub use serve::cmd_serve;
pub use sync_cmd::{cmd_sync, SyncAction};

#[derive(Parser)]
#[command(name = "sandbot", version, about = "sandbot - control plane for sandboxed agent gateways")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List sandboxes.
    List {
        /// Also collect IP address and resource usage of running sandboxes.
        #[arg(short, long)]
        details: bool,
        #[arg(long)]
        json: bool,
    },
    /// Start a sandbox.
    Start { name: String },
    /// Stop a sandbox.
    Stop { name: String },
    /// Stop every sandbox.
    Shutdown,
    /// Run a command inside a sandbox.
    Exec {
        name: String,
        #[arg(short, long)]
        user: Option<String>,
        /// Seconds before the command is killed.
        #[arg(short, long)]
        timeout: Option<u64>,
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
    /// Import a sandbox from a tar archive.
    Import {
        archive: PathBuf,
        name: String,
        /// Directory that will hold the sandbox's disk.
        install_dir: PathBuf,
    },
    /// Unregister a sandbox and delete its disk.
    Unregister { name: String },
    /// Make a sandbox the default.
    SetDefault { name: String },
    /// Manage the agent gateway.
    Gateway {
        #[command(subcommand)]
        action: GatewayAction,
    },
    /// Synchronize agent configuration with a sandbox.
    Sync {
        #[command(subcommand)]
        action: SyncAction,
    },
    /// Manage stored agent configurations.
    Agents {
        #[command(subcommand)]
        action: AgentsAction,
    },
    /// Run the sandbox monitor, automation server and gateways until Ctrl-C.
    Serve {
        /// Sandbox to run a gateway in; repeatable.
        #[arg(short, long = "gateway")]
        gateways: Vec<String>,
        /// Sandbox to run the bridge agent in.
        #[arg(short, long)]
        bridge: Option<String>,
        /// Do not start the automation server.
        #[arg(long)]
        no_automation: bool,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    if !matches!(cli.command, Commands::Serve { .. }) {
        crate::logging::init_simple_logging();
    }

    match cli.command {
        Commands::List { details, json } => sandbox_cmd::cmd_list(details, json).await,
        Commands::Start { name } => sandbox_cmd::cmd_start(name).await,
        Commands::Stop { name } => sandbox_cmd::cmd_stop(name).await,
        Commands::Shutdown => sandbox_cmd::cmd_shutdown().await,
        Commands::Exec { name, user, timeout, command } => {
            sandbox_cmd::cmd_exec(name, user, timeout, command).await
        }
        Commands::Import { archive, name, install_dir } => {
            sandbox_cmd::cmd_import(archive, name, install_dir).await
        }
        Commands::Unregister { name } => sandbox_cmd::cmd_unregister(name).await,
        Commands::SetDefault { name } => sandbox_cmd::cmd_set_default(name).await,
        Commands::Gateway { action } => cmd_gateway(action).await,
        Commands::Sync { action } => cmd_sync(action).await,
        Commands::Agents { action } => cmd_agents(action).await,
        Commands::Serve { gateways, bridge, no_automation } => {
            cmd_serve(gateways, bridge, no_automation).await
        }
    }
}
