// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use config::RunnerConfig;
use model_runtime::{ModelRegistry, GB};
use protocol::SessionMode;
use tracing::info;

#[derive(Parser)]
#[command(name = "gpu-runner", version, about = "gpu session runner node")]
struct Cli {
    /// optional path to a config file (applies to all subcommands)
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// run the runner: worker api, instance pool and sweeper
    Serve(ServeOpts),

    /// list the models this runner can host
    Models,
}

#[derive(Parser, Debug)]
struct ServeOpts {
    /// address for the worker task api (overrides config)
    #[arg(long)]
    api_socket: Option<SocketAddr>,

    /// gpu memory budget in GB (overrides config)
    #[arg(long)]
    memory_budget_gb: Option<u64>,
}

fn load_config(path: Option<&PathBuf>) -> Result<RunnerConfig> {
    match path {
        Some(path) => config::load_from_file(path),
        None => Ok(RunnerConfig::default()),
    }
}

fn print_models() {
    println!("{:<45} {:<6} {:>10} {:>10}", "model", "type", "inference", "finetune");
    for model in ModelRegistry::builtin().models() {
        println!(
            "{:<45} {:<6} {:>8}GB {:>8}GB",
            model.name(),
            model.session_type(),
            model.memory_requirements(SessionMode::Inference) / GB,
            model.memory_requirements(SessionMode::Finetune) / GB,
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    util::logging::init_tracing();

    let cli = Cli::parse();
    info!("starting gpu-runner: {:?}", cli.command);

    match cli.command {
        Commands::Serve(opts) => {
            let mut config = load_config(cli.config.as_ref())?;
            if let Some(api_socket) = opts.api_socket {
                config.api_socket = api_socket;
            }
            if let Some(memory_budget_gb) = opts.memory_budget_gb {
                config.memory_budget_gb = memory_budget_gb;
            }
            runner::run(config).await?;
        }
        Commands::Models => print_models(),
    }

    Ok(())
}
